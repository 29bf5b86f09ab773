/// Shutdown requests from the operator.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// The first SIGINT or SIGTERM stops the loop at its next suspension point.
/// A second one exits immediately, for when the loop is stuck in a spawn or a
/// slow notification. The STOP file is checked at the top of every cycle and
/// removed once seen.
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Exit status after a second signal: 128 + SIGINT, as shells report it.
const FORCED_EXIT: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Interrupt,
    Terminate,
    StopFile,
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCause::Interrupt => write!(f, "SIGINT"),
            StopCause::Terminate => write!(f, "SIGTERM"),
            StopCause::StopFile => write!(f, "stop file"),
        }
    }
}

/// Sending half, used by the signal task and by tests.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<Option<StopCause>>,
}

impl ShutdownTrigger {
    /// Record `cause`. Returns false if a stop was already requested.
    pub fn trigger(&self, cause: StopCause) -> bool {
        // First cause wins.
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        })
    }
}

pub struct Shutdown {
    rx: watch::Receiver<Option<StopCause>>,
    stop_file: Option<PathBuf>,
}

impl Shutdown {
    /// A shutdown handle driven only by the returned trigger.
    pub fn manual(stop_file: Option<PathBuf>) -> (ShutdownTrigger, Self) {
        let (tx, rx) = watch::channel(None);
        (ShutdownTrigger { tx }, Self { rx, stop_file })
    }

    /// Install SIGINT/SIGTERM listeners on the current runtime.
    pub fn install(stop_file: Option<PathBuf>) -> std::io::Result<Self> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let (trigger, shutdown) = Self::manual(stop_file);
        tokio::spawn(async move {
            loop {
                let cause = tokio::select! {
                    Some(()) = interrupt.recv() => StopCause::Interrupt,
                    Some(()) = terminate.recv() => StopCause::Terminate,
                    else => break,
                };
                if trigger.trigger(cause) {
                    tracing::info!(%cause, "shutdown requested, stopping after the current step");
                } else {
                    tracing::warn!(%cause, "second shutdown signal, exiting now");
                    std::process::exit(FORCED_EXIT);
                }
            }
        });
        Ok(shutdown)
    }

    /// Non-blocking check, including the STOP file.
    pub fn requested(&mut self) -> Option<StopCause> {
        if let Some(cause) = *self.rx.borrow() {
            return Some(cause);
        }
        let path = self.stop_file.as_deref()?;
        if !path.exists() {
            return None;
        }
        consume_stop_file(path);
        Some(StopCause::StopFile)
    }

    /// Resolve once a signal arrives. Pending forever if the trigger is gone.
    pub async fn wait(&mut self) -> StopCause {
        let seen = self.rx.wait_for(Option::is_some).await.map(|cause| *cause);
        match seen {
            Ok(cause) => cause.unwrap_or(StopCause::Interrupt),
            Err(_) => std::future::pending().await,
        }
    }
}

fn consume_stop_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove stop file");
    }
}
