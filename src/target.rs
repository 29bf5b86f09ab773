use std::path::{Path, PathBuf};

/// The program being supervised, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// The name as the operator typed it, used in subjects and log lines.
    pub display_name: String,
    /// Canonical absolute path. Symlinks are resolved so it compares equal to
    /// the paths the kernel reports for open file handles.
    pub resolved_path: PathBuf,
}

/// Errors from resolving the target at startup.
#[derive(Debug)]
pub enum TargetError {
    Empty,
    Resolve {
        name: String,
        source: std::io::Error,
    },
    NotAFile {
        path: PathBuf,
    },
}

impl std::fmt::Display for TargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::Empty => write!(f, "target name is empty"),
            TargetError::Resolve { name, source } => {
                write!(f, "cannot resolve target '{}': {}", name, source)
            }
            TargetError::NotAFile { path } => {
                write!(f, "target {} is not a regular file", path.display())
            }
        }
    }
}

impl std::error::Error for TargetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TargetError::Resolve { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl TargetSpec {
    /// Resolve a user-supplied name relative to the current directory.
    pub fn resolve(name: &str) -> Result<Self, TargetError> {
        let cwd = std::env::current_dir().map_err(|e| TargetError::Resolve {
            name: name.to_string(),
            source: e,
        })?;
        Self::resolve_in(name, &cwd)
    }

    /// Resolve `name` against `base`. The path must exist and be a file.
    pub fn resolve_in(name: &str, base: &Path) -> Result<Self, TargetError> {
        if name.trim().is_empty() {
            return Err(TargetError::Empty);
        }
        let candidate = base.join(name);
        let resolved_path =
            std::fs::canonicalize(&candidate).map_err(|e| TargetError::Resolve {
                name: name.to_string(),
                source: e,
            })?;
        if !resolved_path.is_file() {
            return Err(TargetError::NotAFile {
                path: resolved_path,
            });
        }
        Ok(Self {
            display_name: name.to_string(),
            resolved_path,
        })
    }

    /// Directory the target is launched from.
    pub fn working_dir(&self) -> &Path {
        self.resolved_path.parent().unwrap_or(Path::new("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bot.py"), "print('hi')").unwrap();

        let target = TargetSpec::resolve_in("bot.py", dir.path()).unwrap();
        assert_eq!(target.display_name, "bot.py");
        assert!(target.resolved_path.is_absolute());
        assert_eq!(
            target.resolved_path,
            std::fs::canonicalize(dir.path().join("bot.py")).unwrap()
        );
        assert_eq!(
            target.working_dir(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[test]
    fn test_resolve_absolute_name_ignores_base() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bot.py");
        std::fs::write(&script, "").unwrap();

        let target = TargetSpec::resolve_in(script.to_str().unwrap(), Path::new("/nowhere")).unwrap();
        assert_eq!(target.resolved_path, std::fs::canonicalize(&script).unwrap());
    }

    #[test]
    fn test_resolve_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TargetSpec::resolve_in("missing.py", dir.path()).unwrap_err();
        assert!(matches!(err, TargetError::Resolve { .. }));
        assert!(err.to_string().contains("missing.py"));
    }

    #[test]
    fn test_resolve_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        let err = TargetSpec::resolve_in("pkg", dir.path()).unwrap_err();
        assert!(matches!(err, TargetError::NotAFile { .. }));
    }

    #[test]
    fn test_resolve_empty_is_error() {
        assert!(matches!(
            TargetSpec::resolve_in("  ", Path::new("/")),
            Err(TargetError::Empty)
        ));
    }
}
