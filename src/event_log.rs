/// Append-only history of supervisor events.
///
/// One line per entry, `<timestamp> <message>`, never rotated or truncated.
/// Line breaks inside a message are folded into ` | ` so every line of the
/// file carries a timestamp. Every entry is mirrored to the console through
/// tracing.
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the log once so an unwritable location fails at startup rather
    /// than silently on every cycle.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let log = Self::new(path);
        log.append_file()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an informational entry.
    pub fn record(&self, message: &str) {
        tracing::info!("{message}");
        self.append(message);
    }

    /// Record an entry that also warrants attention on the console.
    pub fn record_warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.append(message);
    }

    fn append(&self, message: &str) {
        let line = format_entry(Local::now(), message);
        let result = self
            .append_file()
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "failed to append to event log"
            );
        }
    }

    fn append_file(&self) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

fn format_entry<Tz: chrono::TimeZone>(at: chrono::DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let message = message
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");
    format!("{} {}\n", at.format("%Y-%m-%d %H:%M:%S%.6f"), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_entry() {
        let at = chrono::Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap();
        assert_eq!(
            format_entry(at, "Success: Started Script"),
            "2024-03-09 14:05:07.000000 Success: Started Script\n"
        );
    }

    #[test]
    fn test_multi_line_message_stays_on_one_line() {
        let at = chrono::Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap();
        assert_eq!(
            format_entry(at, "Notification via command failed: mail exited with Some(1)\nno MTA\n\n"),
            "2024-03-09 14:05:07.000000 Notification via command failed: mail exited with Some(1) | no MTA\n"
        );
    }

    #[test]
    fn test_every_file_line_is_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runwatch.log");
        let log = EventLog::new(&path);
        log.record("---> The script 'bot.py' is already running <---\n* Script Path: '/srv/bot.py'");
        log.record_warn("Crash - Error: child 7 terminated abnormally\r\n  caused by: boom");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(chrono::NaiveDateTime::parse_from_str(&line[..26], "%Y-%m-%d %H:%M:%S%.6f").is_ok());
        }
        assert!(contents.contains("<--- | * Script Path: '/srv/bot.py'"));
    }

    #[test]
    fn test_record_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runwatch.log");
        std::fs::write(&path, "existing line\n").unwrap();

        let log = EventLog::new(&path);
        log.record("first");
        log.record_warn("second");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing line");
        assert!(lines[1].ends_with(" first"));
        assert!(lines[2].ends_with(" second"));
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.log");
        let log = EventLog::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(log.path(), path);
    }

    #[test]
    fn test_open_unwritable_location_fails() {
        assert!(EventLog::open("/nonexistent-dir/impossible/runwatch.log").is_err());
    }

    #[test]
    fn test_record_to_unwritable_location_does_not_panic() {
        let log = EventLog::new("/nonexistent-dir/impossible/runwatch.log");
        log.record("dropped");
    }
}
