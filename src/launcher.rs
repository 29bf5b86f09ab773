/// Launch the target as a detached child: own process group, output kept off
/// the supervisor's console, no retries.
use crate::config::{LaunchConfig, TargetConfig};
use crate::notify::Severity;
use crate::target::TargetSpec;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// A successful launch.
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    /// How the previously launched child ended, if it has been reaped since.
    pub previous_exit: Option<ExitStatus>,
}

/// Errors that can occur while launching the target.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to open the file that receives child output.
    OutputFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to create the child process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The child started but terminated abnormally within the startup grace.
    ChildCrash { pid: u32, status: ExitStatus },
    /// Could not query the child's state after spawning.
    Wait { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::OutputFile { path, source } => {
                write!(
                    f,
                    "failed to open child output file {}: {}",
                    path.display(),
                    source
                )
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            LaunchError::ChildCrash { pid, status } => {
                write!(
                    f,
                    "child {} terminated abnormally ({})",
                    pid,
                    describe_exit(*status)
                )
            }
            LaunchError::Wait { pid, source } => {
                write!(f, "failed to check child {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::OutputFile { source, .. } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::ChildCrash { .. } => None,
            LaunchError::Wait { source, .. } => Some(source),
        }
    }
}

impl LaunchError {
    /// CRASH when the child itself died, ERROR for everything else.
    pub fn severity(&self) -> Severity {
        match self {
            LaunchError::ChildCrash { .. } => Severity::Crash,
            _ => Severity::Error,
        }
    }
}

/// Human-readable exit status: "exit code 3" or "killed by SIGSEGV".
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    match status.signal() {
        Some(sig) => match Signal::try_from(sig) {
            Ok(signal) => format!("killed by {}", signal.as_str()),
            Err(_) => format!("killed by signal {sig}"),
        },
        None => "unknown status".to_string(),
    }
}

/// Anything that can start the target for the supervisor loop.
#[async_trait]
pub trait Launch: Send {
    async fn start(&mut self, target: &TargetSpec) -> Result<Launched, LaunchError>;
}

/// Spawns `<interpreter> [launch_args...] <target>` from the target's directory.
pub struct Launcher {
    interpreter: String,
    launch_args: Vec<String>,
    output_file: Option<PathBuf>,
    startup_grace: Duration,
    last_child: Option<Child>,
}

impl Launcher {
    pub fn new(target_config: &TargetConfig, launch_config: &LaunchConfig) -> Self {
        Self {
            interpreter: target_config.interpreter.clone(),
            launch_args: target_config.launch_args.clone(),
            output_file: launch_config.output_file().map(Path::to_path_buf),
            startup_grace: launch_config.startup_grace(),
            last_child: None,
        }
    }

    /// Program and arguments for launching `target`.
    fn build_command(&self, target: &TargetSpec) -> (String, Vec<String>) {
        let path = target.resolved_path.to_string_lossy().into_owned();
        if self.interpreter.is_empty() {
            return (path, self.launch_args.clone());
        }
        let mut args = self.launch_args.clone();
        args.push(path);
        (self.interpreter.clone(), args)
    }

    fn output_stdio(&self) -> Result<(Stdio, Stdio), LaunchError> {
        let Some(path) = &self.output_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let open_err = |e: std::io::Error| LaunchError::OutputFile {
            path: path.clone(),
            source: e,
        };
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_err)?;
        // Second handle for stderr since File doesn't impl Clone
        let stderr = stdout.try_clone().map_err(open_err)?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// Reap the previous child if it has exited since the last launch.
    fn reap_previous(&mut self) -> Option<ExitStatus> {
        let mut child = self.last_child.take()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(
                    pid = ?child.id(),
                    status = %describe_exit(status),
                    "previous child exited"
                );
                Some(status)
            }
            Ok(None) => {
                // Still running but not recognised by the liveness check.
                // Dropping the handle leaves it running; tokio reaps it later.
                tracing::warn!(pid = ?child.id(), "previous child still running, launching anyway");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to reap previous child");
                None
            }
        }
    }
}

#[async_trait]
impl Launch for Launcher {
    async fn start(&mut self, target: &TargetSpec) -> Result<Launched, LaunchError> {
        let previous_exit = self.reap_previous();
        let (stdout, stderr) = self.output_stdio()?;
        let (program, args) = self.build_command(target);
        tracing::info!(
            command = %program,
            args = ?args,
            cwd = %target.working_dir().display(),
            "spawning target"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(target.working_dir())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0) // Own group so the operator's Ctrl-C doesn't reach it
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "target started");

        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                return Err(LaunchError::ChildCrash { pid, status });
            }
            Ok(Some(status)) => {
                tracing::info!(pid, status = %describe_exit(status), "target exited cleanly during startup");
            }
            Ok(None) => self.last_child = Some(child),
            Err(e) => return Err(LaunchError::Wait { pid, source: e }),
        }

        Ok(Launched { pid, previous_exit })
    }
}
