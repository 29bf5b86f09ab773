use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from runwatch.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub target: TargetConfig,
    pub heartbeat: HeartbeatConfig,
    pub event_log: EventLogConfig,
    pub launch: LaunchConfig,
    pub notify: NotifyConfig,
    pub shutdown: ShutdownConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Interpreter used to run the target and to recognise it in the process table.
    /// Empty means the target is executed directly.
    pub interpreter: String,
    /// Extra arguments placed between the interpreter and the target path.
    pub launch_args: Vec<String>,
    /// Also treat a process whose argv names the target as a match.
    /// Unset means on whenever an interpreter is configured.
    pub match_cmdline: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub path: PathBuf,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Where child stdout/stderr are appended. Empty discards them.
    pub output_file: Option<PathBuf>,
    pub startup_grace_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub webhook_url: String,
    pub webhook_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct StatusConfig {
    pub path: Option<PathBuf>,
}

/// Values from the command line that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub heartbeat: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    pub event_log: Option<PathBuf>,
    pub interpreter: Option<String>,
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl SupervisorConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply CLI overrides on top of file values.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(path) = overrides.heartbeat {
            self.heartbeat.path = path;
        }
        if let Some(secs) = overrides.interval_secs {
            self.heartbeat.interval_secs = secs;
        }
        if let Some(path) = overrides.event_log {
            self.event_log.path = path;
        }
        if let Some(interpreter) = overrides.interpreter {
            self.target.interpreter = interpreter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.event_log.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("event_log.path is empty".to_string()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }
}

impl TargetConfig {
    /// Interpreters such as CPython close the script once compiled, so an
    /// interpreted target is only found reliably through its argv.
    pub fn matches_cmdline(&self) -> bool {
        self.match_cmdline.unwrap_or(!self.interpreter.is_empty())
    }
}

impl LaunchConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn output_file(&self) -> Option<&Path> {
        non_empty(&self.output_file)
    }
}

impl ShutdownConfig {
    pub fn stop_file(&self) -> Option<&Path> {
        non_empty(&self.stop_file)
    }
}

impl StatusConfig {
    pub fn path(&self) -> Option<&Path> {
        non_empty(&self.path)
    }
}

/// `path = ""` in the file means "disabled", same as leaving it out.
fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

// --- Default implementations ---

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            launch_args: Vec::new(),
            match_cmdline: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("3cqsbot.log"),
            interval_secs: 60,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("runwatch.log"),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            output_file: None,
            startup_grace_ms: 500,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            webhook_url: String::new(),
            webhook_timeout_secs: 10,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: Some(PathBuf::from("STOP")),
        }
    }
}
