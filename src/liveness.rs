/// Liveness check: is the target's process currently in the process table?
///
/// A process matches when it is an interpreter of the configured runtime and
/// holds the target file open. Introspection failures on a single process are
/// skipped; a failure of the whole scan reports "not running", which favours a
/// duplicate launch over leaving the target down.
use crate::event_log::EventLog;
use crate::target::TargetSpec;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Anything that can answer "is the target alive?" for the supervisor loop.
pub trait LivenessProbe: Send {
    fn is_running(&mut self, target: &TargetSpec) -> bool;
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub cmd: Vec<String>,
}

/// Why a process (or the whole table) could not be inspected.
#[derive(Debug)]
pub enum ScanError {
    AccessDenied { pid: u32 },
    NoSuchProcess { pid: u32 },
    Zombie { pid: u32 },
    Unsupported,
    Io { source: std::io::Error },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::AccessDenied { pid } => write!(f, "access denied to process {pid}"),
            ScanError::NoSuchProcess { pid } => write!(f, "process {pid} no longer exists"),
            ScanError::Zombie { pid } => write!(f, "process {pid} is a zombie"),
            ScanError::Unsupported => {
                write!(f, "open file inspection is not supported on this platform")
            }
            ScanError::Io { source } => write!(f, "process table I/O error: {source}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Io { source } => Some(source),
            _ => None,
        }
    }
}

impl ScanError {
    fn from_io(pid: u32, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ScanError::AccessDenied { pid },
            std::io::ErrorKind::NotFound => ScanError::NoSuchProcess { pid },
            _ => ScanError::Io { source: e },
        }
    }
}

/// Source of process-table data. Implemented over the live OS and by fakes in tests.
pub trait ProcessTable: Send {
    /// Enumerate processes visible to the current user.
    fn snapshot(&mut self) -> Result<Vec<ProcessEntry>, ScanError>;

    /// Paths of the files a process currently holds open.
    fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, ScanError>;
}

/// Live process table: enumeration via sysinfo, open files via procfs.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Whether `open_files` can answer on this platform (procfs only).
    pub fn inspects_open_files() -> bool {
        cfg!(target_os = "linux")
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&mut self) -> Result<Vec<ProcessEntry>, ScanError> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
        Ok(self
            .system
            .processes()
            .iter()
            // Linux lists threads alongside processes; they share the fd table.
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                exe: process.exe().map(Path::to_path_buf),
                cmd: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect())
    }

    fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, ScanError> {
        if !Self::inspects_open_files() {
            return Err(ScanError::Unsupported);
        }
        if is_zombie(pid) {
            return Err(ScanError::Zombie { pid });
        }
        let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
        let entries = std::fs::read_dir(&fd_dir).map_err(|e| ScanError::from_io(pid, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ScanError::from_io(pid, e))?;
            // Descriptors can close between readdir and readlink.
            if let Ok(target) = std::fs::read_link(entry.path()) {
                if target.is_absolute() {
                    files.push(target);
                }
            }
        }
        Ok(files)
    }
}

fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: "pid (comm) S ..."; comm may contain spaces and parens.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after = stat.rfind(')')?;
            stat[after + 1..].split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

/// Whether a process name (or executable file name) belongs to `interpreter`.
///
/// Case-insensitive and tolerant of version suffixes, so `python` matches
/// `Python`, `python3` and `python3.12`. A path such as `/usr/bin/python3` is
/// compared by its file name. An empty interpreter matches any process.
pub fn is_interpreter(entry: &ProcessEntry, interpreter: &str) -> bool {
    if interpreter.is_empty() {
        return true;
    }
    let wanted = Path::new(interpreter)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| interpreter.to_ascii_lowercase());
    let exe_name = entry
        .exe
        .as_deref()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned());
    std::iter::once(entry.name.clone())
        .chain(exe_name)
        .any(|candidate| name_matches(&candidate.to_ascii_lowercase(), &wanted))
}

fn name_matches(candidate: &str, wanted: &str) -> bool {
    match candidate.strip_prefix(wanted) {
        Some(rest) => rest.chars().all(|c| c.is_ascii_digit() || c == '.'),
        None => false,
    }
}

/// Matches the target against a process table.
pub struct ProcessMatcher<T: ProcessTable> {
    table: T,
    interpreter: String,
    match_cmdline: bool,
    log: EventLog,
}

impl<T: ProcessTable> ProcessMatcher<T> {
    pub fn new(table: T, interpreter: impl Into<String>, log: EventLog) -> Self {
        Self {
            table,
            interpreter: interpreter.into(),
            match_cmdline: false,
            log,
        }
    }

    /// Also accept a process whose argv names the target path. Interpreters
    /// such as CPython close the script after compiling it, so open-file
    /// matching alone misses them.
    pub fn with_cmdline_matching(mut self, enabled: bool) -> Self {
        self.match_cmdline = enabled;
        self
    }

    /// PID of the first process matching the target.
    ///
    /// Where open files cannot be inspected at all, argv is the only evidence
    /// left and is used regardless of `match_cmdline`.
    pub fn find(&mut self, target: &TargetSpec) -> Result<Option<u32>, ScanError> {
        let processes = self.table.snapshot()?;
        for process in processes {
            if !is_interpreter(&process, &self.interpreter) {
                continue;
            }
            let names_target = process
                .cmd
                .iter()
                .any(|arg| Path::new(arg) == target.resolved_path);
            if self.match_cmdline && names_target {
                return Ok(Some(process.pid));
            }
            match self.table.open_files(process.pid) {
                Ok(files) => {
                    if files.iter().any(|f| f == &target.resolved_path) {
                        return Ok(Some(process.pid));
                    }
                }
                Err(ScanError::Unsupported) if names_target => {
                    return Ok(Some(process.pid));
                }
                Err(e) => {
                    tracing::debug!(pid = process.pid, error = %e, "skipping process");
                }
            }
        }
        Ok(None)
    }
}

impl<T: ProcessTable> LivenessProbe for ProcessMatcher<T> {
    fn is_running(&mut self, target: &TargetSpec) -> bool {
        match self.find(target) {
            Ok(Some(pid)) => {
                self.log.record(&format!(
                    "---> The script '{}' is already running with PID '{}' ({}) <---",
                    target.display_name,
                    pid,
                    target.resolved_path.display()
                ));
                true
            }
            Ok(None) => {
                self.log.record(&format!(
                    "---> The script '{}' is NOT running <---",
                    target.display_name
                ));
                false
            }
            Err(e) => {
                self.log.record_warn(&format!(
                    "---> Process scan for '{}' failed, assuming NOT running: {} <---",
                    target.display_name, e
                ));
                false
            }
        }
    }
}
