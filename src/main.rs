mod config;
mod event_log;
mod launcher;
mod liveness;
mod notify;
mod signals;
mod status;
mod supervisor;
mod target;
mod watchdog;

use clap::Parser;
use config::{Overrides, SupervisorConfig};
use event_log::EventLog;
use launcher::Launcher;
use liveness::{ProcessMatcher, SystemProcessTable};
use notify::Notifier;
use signals::{Shutdown, StopCause};
use status::StatusTracker;
use std::path::{Path, PathBuf};
use supervisor::{Collaborators, SupervisorLoop};
use target::TargetSpec;
use tokio::task::JoinError;
use watchdog::{ActivityWatcher, HeartbeatFile};

/// Clean stop requested by the operator, or a dry run.
const EXIT_OK: i32 = 0;
/// The supervision loop itself died.
const EXIT_FATAL: i32 = 1;
/// Bad config, unresolvable target, unwritable event log.
const EXIT_STARTUP: i32 = 2;

/// A Rust CLI tool that keeps a script running: restart it when it
/// disappears from the process table, alert when its heartbeat file stalls,
/// and keep a plain-text history of every event.
#[derive(Parser, Debug)]
#[command(name = "runwatch", version, about)]
pub struct Cli {
    /// The program to supervise (e.g. bot.py)
    #[arg(value_name = "TARGET")]
    target: String,

    /// Config file path
    #[arg(short, long, default_value = "runwatch.toml")]
    config: PathBuf,

    /// Heartbeat file whose mtime proves progress (overrides config)
    #[arg(long)]
    heartbeat: Option<PathBuf>,

    /// Polling interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Event log path (overrides config)
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Interpreter that runs the target; empty runs it directly (overrides config)
    #[arg(long)]
    interpreter: Option<String>,

    /// Resolve the target, print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (scan details, state transitions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on the console
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "runwatch=debug"
    } else if cli.quiet {
        "runwatch=warn"
    } else {
        "runwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match SupervisorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_STARTUP;
        }
    };
    config.apply_overrides(Overrides {
        heartbeat: cli.heartbeat,
        interval_secs: cli.interval,
        event_log: cli.event_log,
        interpreter: cli.interpreter,
    });
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return EXIT_STARTUP;
    }

    let target = match TargetSpec::resolve(&cli.target) {
        Ok(target) => target,
        Err(e) => {
            tracing::error!("{e}");
            return EXIT_STARTUP;
        }
    };
    println!("\n* Script Name: {}", target.display_name);
    println!("* Script Path: {}", target.resolved_path.display());

    if cli.dry_run {
        print_settings(&config);
        println!("Dry run mode — config validated, not running.");
        return EXIT_OK;
    }

    let log = match EventLog::open(&config.event_log.path) {
        Ok(log) => log,
        Err(e) => {
            tracing::error!(path = %config.event_log.path.display(), "cannot open event log: {e}");
            return EXIT_STARTUP;
        }
    };
    tracing::debug!(path = %log.path().display(), "event log opened");
    let notifier = match Notifier::from_config(&config.notify, &target.display_name, log.clone()) {
        Ok(notifier) => notifier,
        Err(e) => {
            tracing::error!("cannot set up notifications: {e}");
            return EXIT_STARTUP;
        }
    };
    tracing::info!(channels = ?notifier.channel_names(), "notification channels");
    let mut shutdown = match Shutdown::install(config.shutdown.stop_file().map(Path::to_path_buf)) {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!("cannot install signal handlers: {e}");
            return EXIT_STARTUP;
        }
    };

    if !SystemProcessTable::inspects_open_files() {
        tracing::warn!(
            "open-file inspection is not available on this platform; \
             the target is recognised by its command line only"
        );
    }

    let parts = Collaborators {
        probe: Box::new(
            ProcessMatcher::new(
                SystemProcessTable::new(),
                config.target.interpreter.clone(),
                log.clone(),
            )
            .with_cmdline_matching(config.target.matches_cmdline()),
        ),
        launcher: Box::new(Launcher::new(&config.target, &config.launch)),
        watcher: ActivityWatcher::new(HeartbeatFile::new(config.heartbeat.path.clone())),
        notifier,
    };
    let status = StatusTracker::new(config.status.path().map(Path::to_path_buf), &target);
    let mut supervisor = SupervisorLoop::new(target, config.interval(), parts, log.clone(), status);

    // A panic inside the loop surfaces here as a JoinError.
    let handle = tokio::spawn(async move { supervisor.run(&mut shutdown).await });
    exit_code(handle.await, &log)
}

/// Map how the supervisor task ended to the process exit code.
fn exit_code(joined: Result<StopCause, JoinError>, log: &EventLog) -> i32 {
    match joined {
        Ok(cause) => {
            tracing::debug!(%cause, "supervisor stopped");
            EXIT_OK
        }
        Err(e) => {
            let reason = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            log.record_warn(&format!(
                "---> Monitoring script crashed with error: {reason} <---"
            ));
            EXIT_FATAL
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn print_settings(config: &SupervisorConfig) {
    let or_none = |p: Option<&Path>| {
        p.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    };
    println!("* Interpreter: {:?}", config.target.interpreter);
    println!("* Heartbeat: {}", config.heartbeat.path.display());
    println!("* Interval: {}sec", config.heartbeat.interval_secs);
    println!("* Event log: {}", config.event_log.path.display());
    println!("* Child output: {}", or_none(config.launch.output_file()));
    println!("* Status file: {}", or_none(config.status.path()));
    println!("* Stop file: {}", or_none(config.shutdown.stop_file()));
    let mut channels = Vec::new();
    if !config.notify.command.is_empty() {
        channels.push(format!("command ({})", config.notify.command));
    }
    if !config.notify.webhook_url.is_empty() {
        channels.push(format!("webhook ({})", config.notify.webhook_url));
    }
    if channels.is_empty() {
        channels.push("(none)".to_string());
    }
    println!("* Notify: {}", channels.join(", "));
}
