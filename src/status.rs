/// Status file: a JSON snapshot of the supervisor, rewritten on every state
/// transition so operators (or scripts) can see what the loop is doing.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::target::TargetSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Checking,
    Running,
    Restarting,
    WatchingHeartbeat,
    Stopped,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SupervisorState,
    pub target: String,
    pub target_path: String,
    pub cycle: u64,
    pub restarts: u64,
    pub stalls: u64,
    pub last_child_pid: Option<u32>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file on disk.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".runwatch.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Counters and state behind the status file. Without a path every call is a no-op.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    target: String,
    target_path: String,
    state: SupervisorState,
    cycle: u64,
    restarts: u64,
    stalls: u64,
    last_child_pid: Option<u32>,
}

impl StatusTracker {
    pub fn new(path: Option<PathBuf>, target: &TargetSpec) -> Self {
        Self {
            file: path.map(StatusFile::new),
            pid: std::process::id(),
            target: target.display_name.clone(),
            target_path: target.resolved_path.display().to_string(),
            state: SupervisorState::Checking,
            cycle: 0,
            restarts: 0,
            stalls: 0,
            last_child_pid: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Move to `state` and rewrite the file.
    pub fn update(&mut self, state: SupervisorState) {
        self.state = state;
        tracing::debug!(?state, cycle = self.cycle, "supervisor state");
        self.flush();
    }

    /// Rewrite the file with the current counters.
    pub fn flush(&self) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = file.write(&self.snapshot()) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn snapshot(&self) -> StatusData {
        StatusData {
            pid: self.pid,
            state: self.state,
            target: self.target.clone(),
            target_path: self.target_path.clone(),
            cycle: self.cycle,
            restarts: self.restarts,
            stalls: self.stalls,
            last_child_pid: self.last_child_pid,
            last_update: Utc::now(),
        }
    }

    pub fn next_cycle(&mut self) -> u64 {
        self.cycle += 1;
        self.cycle
    }

    pub fn record_restart(&mut self, pid: u32) {
        self.restarts += 1;
        self.last_child_pid = Some(pid);
    }

    pub fn record_stall(&mut self) {
        self.stalls += 1;
    }

    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
