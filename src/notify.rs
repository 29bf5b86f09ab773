/// Out-of-band notifications: fire-and-forget delivery of (subject, body).
///
/// Channels report their own failures; `Notifier` swallows them into the
/// event log so a broken mail setup can never stop the supervisor.
use crate::config::NotifyConfig;
use crate::event_log::EventLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Success,
    Crash,
    Error,
    Stall,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Success => "SUCCESS",
            Severity::Crash => "CRASH",
            Severity::Error => "ERROR",
            Severity::Stall => "STALL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub subject: String,
    pub body: String,
    pub severity: Severity,
}

/// Errors from a single delivery attempt.
#[derive(Debug)]
pub enum NotifyError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    Io {
        source: std::io::Error,
    },
    Http {
        source: reqwest::Error,
    },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Spawn { program, source } => {
                write!(f, "failed to run {}: {}", program, source)
            }
            NotifyError::CommandFailed {
                program,
                code,
                stderr,
            } => {
                write!(f, "{} exited with {:?}", program, code)?;
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            NotifyError::Io { source } => write!(f, "I/O error while notifying: {}", source),
            NotifyError::Http { source } => write!(f, "webhook request failed: {}", source),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Spawn { source, .. } => Some(source),
            NotifyError::CommandFailed { .. } => None,
            NotifyError::Io { source } => Some(source),
            NotifyError::Http { source } => Some(source),
        }
    }
}

/// One way of getting a message to a human.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Short name used in log lines (e.g., "command", "webhook").
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Runs a local program per notification, e.g. `mail -s {subject} ops@example.com`.
///
/// `{subject}` and `{body}` placeholders in args are substituted; the body is
/// also written to the program's stdin.
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
}

impl CommandChannel {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn build_args(&self, event: &NotificationEvent) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{subject}", &event.subject)
                    .replace("{body}", &event.body)
            })
            .collect()
    }
}

#[async_trait]
impl NotifyChannel for CommandChannel {
    fn name(&self) -> &str {
        "command"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.program)
            .args(self.build_args(event))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NotifyError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may close it early; that's not a failure.
            if let Err(e) = stdin.write_all(event.body.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(NotifyError::Io { source: e });
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| NotifyError::Io { source: e })?;
        if !output.status.success() {
            return Err(NotifyError::CommandFailed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
    severity: Severity,
    target: &'a str,
    host: &'a str,
    timestamp: DateTime<Utc>,
}

/// POSTs a JSON payload per notification.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    target: String,
    host: String,
}

impl WebhookChannel {
    pub fn new(
        url: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Http { source: e })?;
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            client,
            url: url.into(),
            target: target.into(),
            host,
        })
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            subject: &event.subject,
            body: &event.body,
            severity: event.severity,
            target: &self.target,
            host: &self.host,
            timestamp: Utc::now(),
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NotifyError::Http { source: e })?;
        Ok(())
    }
}

/// Fans an event out to every configured channel. Never fails.
pub struct Notifier {
    channels: Vec<Box<dyn NotifyChannel>>,
    log: EventLog,
}

impl Notifier {
    pub fn new(log: EventLog) -> Self {
        Self {
            channels: Vec::new(),
            log,
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn NotifyChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Build the channels named in `[notify]`.
    pub fn from_config(
        config: &NotifyConfig,
        target_name: &str,
        log: EventLog,
    ) -> Result<Self, NotifyError> {
        let mut notifier = Self::new(log);
        if !config.command.is_empty() {
            notifier = notifier.with_channel(Box::new(CommandChannel::new(
                config.command.clone(),
                config.args.clone(),
            )));
        }
        if !config.webhook_url.is_empty() {
            notifier = notifier.with_channel(Box::new(WebhookChannel::new(
                config.webhook_url.clone(),
                target_name,
                Duration::from_secs(config.webhook_timeout_secs),
            )?));
        }
        Ok(notifier)
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver `event` on every channel, logging each outcome.
    pub async fn send(&self, event: &NotificationEvent) {
        tracing::info!(severity = %event.severity, subject = %event.subject, "notification");
        if self.channels.is_empty() {
            self.log.record(&format!(
                "Notification not delivered (no channel configured): {}",
                event.subject
            ));
            return;
        }
        for channel in &self.channels {
            match channel.deliver(event).await {
                Ok(()) => self.log.record(&format!(
                    "Notification sent via {} with subject: {}",
                    channel.name(),
                    event.subject
                )),
                Err(e) => self.log.record_warn(&format!(
                    "Notification via {} failed: {}",
                    channel.name(),
                    e
                )),
            }
        }
    }
}
