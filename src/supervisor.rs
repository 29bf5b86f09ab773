/// The supervision loop: check liveness, restart when down, watch the
/// heartbeat across one fixed interval, notify on every failure, repeat.
///
/// Per-cycle failures are classified and reported, never fatal. The only way
/// out of `run` is an operator stop request.
use crate::event_log::EventLog;
use crate::launcher::{describe_exit, Launch, LaunchError, Launched};
use crate::liveness::LivenessProbe;
use crate::notify::{NotificationEvent, Notifier, Severity};
use crate::signals::{Shutdown, StopCause};
use crate::status::{StatusTracker, SupervisorState};
use crate::target::TargetSpec;
use crate::watchdog::ActivityWatcher;
use std::time::Duration;

/// What happened in one pass of the loop. Discarded after logging.
#[derive(Debug, Default)]
pub struct LoopIteration {
    pub alive: bool,
    pub restarted: bool,
    pub stall_detected: bool,
    pub error: Option<LaunchError>,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(LoopIteration),
    Stopped(StopCause),
}

/// The pieces the loop drives, each behind the seam tests replace.
pub struct Collaborators {
    pub probe: Box<dyn LivenessProbe>,
    pub launcher: Box<dyn Launch>,
    pub watcher: ActivityWatcher,
    pub notifier: Notifier,
}

pub struct SupervisorLoop {
    target: TargetSpec,
    interval: Duration,
    probe: Box<dyn LivenessProbe>,
    launcher: Box<dyn Launch>,
    watcher: ActivityWatcher,
    notifier: Notifier,
    log: EventLog,
    status: StatusTracker,
}

impl SupervisorLoop {
    pub fn new(
        target: TargetSpec,
        interval: Duration,
        parts: Collaborators,
        log: EventLog,
        status: StatusTracker,
    ) -> Self {
        Self {
            target,
            interval,
            probe: parts.probe,
            launcher: parts.launcher,
            watcher: parts.watcher,
            notifier: parts.notifier,
            log,
            status,
        }
    }

    /// Supervise until the operator asks to stop.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> StopCause {
        self.log.record(&format!(
            "---> Monitoring '{}' ({}) every {}sec, heartbeat {} <---",
            self.target.display_name,
            self.target.resolved_path.display(),
            self.interval.as_secs(),
            self.watcher.path().display()
        ));
        loop {
            if let Some(cause) = shutdown.requested() {
                return self.stop(cause);
            }
            match self.run_cycle(shutdown).await {
                CycleOutcome::Completed(iteration) => {
                    tracing::debug!(
                        alive = iteration.alive,
                        restarted = iteration.restarted,
                        stall = iteration.stall_detected,
                        error = iteration.error.is_some(),
                        "cycle complete"
                    );
                }
                CycleOutcome::Stopped(cause) => return self.stop(cause),
            }
        }
    }

    /// One pass: Checking -> Running | Restarting -> WatchingHeartbeat.
    pub async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> CycleOutcome {
        let cycle = self.status.next_cycle();
        self.status.update(SupervisorState::Checking);
        tracing::debug!(cycle, "checking liveness");

        let mut iteration = LoopIteration {
            alive: self.probe.is_running(&self.target),
            ..Default::default()
        };

        if iteration.alive {
            self.status.update(SupervisorState::Running);
            self.log.record(&format!(
                "{} already running, not restarted this cycle, re-check in {}sec",
                self.target.display_name,
                self.interval.as_secs()
            ));
        } else {
            self.status.update(SupervisorState::Restarting);
            match self.launcher.start(&self.target).await {
                Ok(launched) => {
                    iteration.restarted = true;
                    self.status.record_restart(launched.pid);
                    self.log.record(&format!(
                        "Success: Started Script '{}' with PID {}",
                        self.target.display_name, launched.pid
                    ));
                    self.notifier
                        .send(&success_event(&self.target, &launched))
                        .await;
                }
                Err(e) => {
                    let event = failure_event(&self.target, &e);
                    match event.severity {
                        Severity::Crash => self.log.record_warn(&format!("Crash - Error: {e}")),
                        _ => self.log.record_warn(&format!("Exception - Error: {e}")),
                    }
                    self.notifier.send(&event).await;
                    iteration.error = Some(e);
                }
            }
        }

        self.status.update(SupervisorState::WatchingHeartbeat);
        let advanced = tokio::select! {
            advanced = self.watcher.did_advance(self.interval) => advanced,
            cause = shutdown.wait() => return CycleOutcome::Stopped(cause),
        };

        if !advanced {
            iteration.stall_detected = true;
            self.status.record_stall();
            self.status.flush();
            self.log.record_warn(&format!(
                "Heartbeat:{} not written to in {}sec - possible stall",
                self.watcher.path().display(),
                self.interval.as_secs()
            ));
            self.notifier
                .send(&stall_event(&self.target, &self.watcher, self.interval))
                .await;
        }

        CycleOutcome::Completed(iteration)
    }

    /// No notification on this path.
    fn stop(&mut self, cause: StopCause) -> StopCause {
        self.status.update(SupervisorState::Stopped);
        self.log
            .record(&format!("---> Monitoring script stopped by user ({cause}) <---"));
        self.status.remove();
        cause
    }
}

fn success_event(target: &TargetSpec, launched: &Launched) -> NotificationEvent {
    let mut body = format!(
        "The {} script has started/restarted successfully (PID {}).",
        target.display_name, launched.pid
    );
    if let Some(status) = launched.previous_exit {
        body.push_str(&format!(
            "\nThe previous instance ended with {}.",
            describe_exit(status)
        ));
    }
    NotificationEvent {
        subject: format!(
            "SUCCESS:{} script has started/restarted successfully",
            target.display_name
        ),
        body,
        severity: Severity::Success,
    }
}

fn failure_event(target: &TargetSpec, error: &LaunchError) -> NotificationEvent {
    let severity = error.severity();
    let (subject, summary) = match severity {
        Severity::Crash => (
            format!("CRASH:{} script has crashed", target.display_name),
            format!("The {} script has crashed.", target.display_name),
        ),
        _ => (
            format!("ERROR:{} script has error", target.display_name),
            format!("The {} script has error.", target.display_name),
        ),
    };
    NotificationEvent {
        subject,
        body: format!(
            "{summary}\n\nTarget: {}\n\nDiagnostics:\n{}",
            target.resolved_path.display(),
            diagnostic(error)
        ),
        severity,
    }
}

fn stall_event(
    target: &TargetSpec,
    watcher: &ActivityWatcher,
    interval: Duration,
) -> NotificationEvent {
    let secs = interval.as_secs();
    NotificationEvent {
        subject: format!(
            "STALL:{} - heartbeat {} hasn't been written to in {}sec",
            target.display_name,
            watcher.path().display(),
            secs
        ),
        body: format!(
            "The {} script has likely stalled. Heartbeat {} not written to in {} seconds.",
            target.display_name,
            watcher.path().display(),
            secs
        ),
        severity: Severity::Stall,
    }
}

/// The error followed by its `source()` chain, one cause per line.
fn diagnostic(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  caused by: {cause}"));
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::RecordingChannel;
    use crate::watchdog::HeartbeatFile;
    use async_trait::async_trait;
    use filetime::FileTime;
    use std::os::unix::process::ExitStatusExt;
    use std::path::{Path, PathBuf};
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeProbe {
        alive: bool,
        calls: Arc<AtomicUsize>,
    }

    impl LivenessProbe for FakeProbe {
        fn is_running(&mut self, _target: &TargetSpec) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive
        }
    }

    #[derive(Clone, Copy)]
    enum LaunchMode {
        Succeed,
        Crash,
        SpawnFails,
    }

    struct FakeLauncher {
        mode: LaunchMode,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Launch for FakeLauncher {
        async fn start(&mut self, _target: &TargetSpec) -> Result<Launched, LaunchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            match self.mode {
                LaunchMode::Succeed => Ok(Launched {
                    pid: 1000 + n,
                    previous_exit: None,
                }),
                LaunchMode::Crash => Err(LaunchError::ChildCrash {
                    pid: 1000 + n,
                    status: ExitStatus::from_raw(1 << 8),
                }),
                LaunchMode::SpawnFails => Err(LaunchError::Spawn {
                    program: "python3".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                }),
            }
        }
    }

    struct Harness {
        supervisor: SupervisorLoop,
        channel: RecordingChannel,
        probe_calls: Arc<AtomicUsize>,
        launch_calls: Arc<AtomicUsize>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(alive: bool, mode: LaunchMode, interval: Duration) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let log = EventLog::new(dir.path().join("runwatch.log"));
            let channel = RecordingChannel::default();
            let probe_calls = Arc::new(AtomicUsize::new(0));
            let launch_calls = Arc::new(AtomicUsize::new(0));
            let target = TargetSpec {
                display_name: "bot.py".to_string(),
                resolved_path: PathBuf::from("/srv/bot.py"),
            };
            let parts = Collaborators {
                probe: Box::new(FakeProbe {
                    alive,
                    calls: probe_calls.clone(),
                }),
                launcher: Box::new(FakeLauncher {
                    mode,
                    calls: launch_calls.clone(),
                }),
                watcher: ActivityWatcher::new(HeartbeatFile::new(dir.path().join("bot.log"))),
                notifier: Notifier::new(log.clone()).with_channel(Box::new(channel.clone())),
            };
            let status = StatusTracker::new(Some(dir.path().join("runwatch.status")), &target);
            Self {
                supervisor: SupervisorLoop::new(target, interval, parts, log, status),
                channel,
                probe_calls,
                launch_calls,
                dir,
            }
        }

        fn heartbeat(&self) -> PathBuf {
            self.dir.path().join("bot.log")
        }

        fn log(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("runwatch.log")).unwrap_or_default()
        }

        fn count(&self, severity: Severity) -> usize {
            self.channel
                .severities()
                .iter()
                .filter(|s| **s == severity)
                .count()
        }

        async fn cycle(&mut self) -> LoopIteration {
            let (_trigger, mut shutdown) = Shutdown::manual(None);
            match self.supervisor.run_cycle(&mut shutdown).await {
                CycleOutcome::Completed(iteration) => iteration,
                CycleOutcome::Stopped(cause) => panic!("unexpected stop: {cause}"),
            }
        }
    }

    /// Keep bumping the heartbeat's mtime until the returned handle is aborted.
    fn keep_heartbeat_fresh(path: &Path) -> tokio::task::JoinHandle<()> {
        std::fs::write(path, "tick").unwrap();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let mut secs = 1_700_000_000;
            loop {
                secs += 1;
                filetime::set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    const FAST: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn test_dead_target_is_restarted_once_with_success() {
        let mut h = Harness::new(false, LaunchMode::Succeed, FAST);
        let fresh = keep_heartbeat_fresh(&h.heartbeat());

        let iteration = h.cycle().await;
        fresh.abort();

        assert!(!iteration.alive);
        assert!(iteration.restarted);
        assert!(iteration.error.is_none());
        assert!(!iteration.stall_detected);
        assert_eq!(h.launch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.severities(), vec![Severity::Success]);

        let events = h.channel.events.lock().unwrap().clone();
        assert_eq!(
            events[0].subject,
            "SUCCESS:bot.py script has started/restarted successfully"
        );
        assert!(events[0].body.contains("PID 1000"));
        assert!(h.log().contains("Success: Started Script 'bot.py' with PID 1000"));
    }

    #[tokio::test]
    async fn test_child_crash_is_classified_as_crash() {
        let mut h = Harness::new(false, LaunchMode::Crash, FAST);
        let fresh = keep_heartbeat_fresh(&h.heartbeat());

        let iteration = h.cycle().await;
        fresh.abort();

        assert!(!iteration.restarted);
        assert_eq!(
            iteration.error.as_ref().map(LaunchError::severity),
            Some(Severity::Crash)
        );
        assert_eq!(h.launch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.severities(), vec![Severity::Crash]);

        let events = h.channel.events.lock().unwrap().clone();
        assert_eq!(events[0].subject, "CRASH:bot.py script has crashed");
        assert!(events[0].body.contains("exit code 1"));
        assert!(h.log().contains("Crash - Error:"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_classified_as_error_with_diagnostics() {
        let mut h = Harness::new(false, LaunchMode::SpawnFails, FAST);
        let fresh = keep_heartbeat_fresh(&h.heartbeat());

        let iteration = h.cycle().await;
        fresh.abort();

        assert_eq!(
            iteration.error.as_ref().map(LaunchError::severity),
            Some(Severity::Error)
        );
        assert_eq!(h.channel.severities(), vec![Severity::Error]);
        let events = h.channel.events.lock().unwrap().clone();
        assert_eq!(events[0].subject, "ERROR:bot.py script has error");
        assert!(events[0].body.contains("failed to spawn python3"));
        assert!(events[0].body.contains("caused by: no such file"));
        assert!(h.log().contains("Exception - Error:"));
    }

    #[tokio::test]
    async fn test_never_success_and_failure_in_same_cycle() {
        for mode in [LaunchMode::Succeed, LaunchMode::Crash, LaunchMode::SpawnFails] {
            let mut h = Harness::new(false, mode, FAST);
            h.cycle().await;
            let success = h.count(Severity::Success);
            let failure = h.count(Severity::Crash) + h.count(Severity::Error);
            assert_eq!(success + failure, 1);
            assert_eq!(h.launch_calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_alive_target_is_never_launched() {
        let mut h = Harness::new(true, LaunchMode::Succeed, FAST);
        for _ in 0..3 {
            let iteration = h.cycle().await;
            assert!(iteration.alive);
            assert!(!iteration.restarted);
        }
        assert_eq!(h.probe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.launch_calls.load(Ordering::SeqCst), 0);
        assert!(h.log().contains("not restarted this cycle"));
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_and_alive_sends_nothing() {
        let mut h = Harness::new(true, LaunchMode::Succeed, FAST);
        let fresh = keep_heartbeat_fresh(&h.heartbeat());

        let iteration = h.cycle().await;
        fresh.abort();

        assert!(!iteration.stall_detected);
        assert!(h.channel.severities().is_empty());
    }

    #[tokio::test]
    async fn test_one_stall_per_cycle_regardless_of_liveness() {
        for alive in [true, false] {
            let mut h = Harness::new(alive, LaunchMode::Succeed, FAST);
            std::fs::write(h.heartbeat(), "stale").unwrap();
            filetime::set_file_mtime(h.heartbeat(), FileTime::from_unix_time(1_600_000_000, 0))
                .unwrap();

            for cycle in 1..=3 {
                let iteration = h.cycle().await;
                assert!(iteration.stall_detected);
                assert_eq!(h.count(Severity::Stall), cycle);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_heartbeat_is_a_stall() {
        let mut h = Harness::new(true, LaunchMode::Succeed, FAST);
        let iteration = h.cycle().await;
        assert!(iteration.stall_detected);

        let events = h.channel.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].subject.starts_with("STALL:bot.py - heartbeat"));
        assert!(h.log().contains("possible stall"));
    }

    #[tokio::test]
    async fn test_interrupt_during_sleep_stops_without_notification() {
        let mut h = Harness::new(true, LaunchMode::Succeed, Duration::from_secs(30));
        let (trigger, mut shutdown) = Shutdown::manual(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger(StopCause::Interrupt);
        });

        let cause = tokio::time::timeout(Duration::from_secs(5), h.supervisor.run(&mut shutdown))
            .await
            .unwrap();

        assert_eq!(cause, StopCause::Interrupt);
        assert!(h.channel.severities().is_empty());
        assert!(h.log().contains("stopped by user"));
        assert!(!h.dir.path().join("runwatch.status").exists());
    }

    #[tokio::test]
    async fn test_stop_file_stops_before_checking() {
        let mut h = Harness::new(false, LaunchMode::Succeed, FAST);
        let stop = h.dir.path().join("STOP");
        std::fs::write(&stop, "").unwrap();
        let (_trigger, mut shutdown) = Shutdown::manual(Some(stop.clone()));

        let cause = h.supervisor.run(&mut shutdown).await;

        assert_eq!(cause, StopCause::StopFile);
        assert_eq!(h.probe_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.launch_calls.load(Ordering::SeqCst), 0);
        assert!(h.channel.severities().is_empty());
        assert!(!stop.exists());
    }

    #[tokio::test]
    async fn test_loop_keeps_going_after_failures() {
        let mut h = Harness::new(false, LaunchMode::SpawnFails, FAST);
        let (trigger, mut shutdown) = Shutdown::manual(None);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.trigger(StopCause::Terminate);
        });

        let cause = h.supervisor.run(&mut shutdown).await;
        stopper.await.unwrap();

        assert_eq!(cause, StopCause::Terminate);
        assert!(h.launch_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            h.count(Severity::Error),
            h.launch_calls.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_status_file_tracks_restarts() {
        let mut h = Harness::new(false, LaunchMode::Succeed, FAST);
        h.cycle().await;
        h.cycle().await;

        let status: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(h.dir.path().join("runwatch.status")).unwrap(),
        )
        .unwrap();
        assert_eq!(status["state"], "watching_heartbeat");
        assert_eq!(status["cycle"], 2);
        assert_eq!(status["restarts"], 2);
        assert_eq!(status["stalls"], 2);
        assert_eq!(status["last_child_pid"], 1001);
    }

    #[test]
    fn test_success_event_mentions_previous_exit() {
        let target = TargetSpec {
            display_name: "bot.py".to_string(),
            resolved_path: PathBuf::from("/srv/bot.py"),
        };
        let event = success_event(
            &target,
            &Launched {
                pid: 7,
                previous_exit: Some(ExitStatus::from_raw(9)),
            },
        );
        assert_eq!(event.severity, Severity::Success);
        assert!(event.body.contains("killed by SIGKILL"));
    }
}
