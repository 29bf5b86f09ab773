/// Heartbeat monitor for the supervised target.
///
/// A process can be present in the process table and still be hung. The target
/// (or something it drives) keeps a heartbeat file fresh; if its modification
/// time does not move across one polling interval the target is stalled.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A file written by the target's ecosystem. Only ever read here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatFile {
    pub path: PathBuf,
}

impl HeartbeatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub struct ActivityWatcher {
    heartbeat: HeartbeatFile,
}

impl ActivityWatcher {
    pub fn new(heartbeat: HeartbeatFile) -> Self {
        Self { heartbeat }
    }

    pub fn path(&self) -> &Path {
        &self.heartbeat.path
    }

    /// Modification time of the heartbeat, or `None` when missing or unreadable.
    pub fn sample(&self) -> Option<SystemTime> {
        match std::fs::metadata(&self.heartbeat.path).and_then(|m| m.modified()) {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                tracing::debug!(
                    path = %self.heartbeat.path.display(),
                    error = %e,
                    "heartbeat not readable"
                );
                None
            }
        }
    }

    /// Sample, wait out `interval`, sample again. The wait is the loop's own
    /// cadence, not a separate timer.
    pub async fn did_advance(&self, interval: Duration) -> bool {
        let before = self.sample();
        tokio::time::sleep(interval).await;
        let after = self.sample();
        let advanced = advanced(before, after);
        tracing::debug!(?before, ?after, advanced, "heartbeat sampled");
        advanced
    }
}

/// Absence at either sample counts as no advancement.
pub fn advanced(before: Option<SystemTime>, after: Option<SystemTime>) -> bool {
    match (before, after) {
        (Some(t0), Some(t1)) => t0 != t1,
        _ => false,
    }
}
