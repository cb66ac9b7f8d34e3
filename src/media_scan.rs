use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Asks the host media index to pick up a freshly copied file.
///
/// Calls are fire-and-forget: implementations must not block the caller and
/// any failure is ignored.
pub trait MediaScanner: Send + Sync {
    fn rescan(&self, path: &Path);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMediaScanner;

impl MediaScanner for NoopMediaScanner {
    fn rescan(&self, _path: &Path) {}
}

/// Runs an external command with the copied path appended as the last argument,
/// e.g. `termux-media-scan <path>`.
#[derive(Debug, Clone)]
pub struct CommandMediaScanner {
    program: String,
    args: Vec<String>,
}

impl CommandMediaScanner {
    /// Builds a scanner from an argv list. Returns `None` for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn run(program: &str, args: &[String], path: &Path) {
        let status = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => {
                tracing::debug!(path = %path.display(), "media scan completed");
            }
            Ok(status) => {
                tracing::debug!(path = %path.display(), %status, "media scan exited with failure");
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "media scan could not start");
            }
        }
    }
}

impl MediaScanner for CommandMediaScanner {
    fn rescan(&self, path: &Path) {
        let program = self.program.clone();
        let args = self.args.clone();
        let path: PathBuf = path.to_path_buf();

        std::thread::spawn(move || Self::run(&program, &args, &path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_argv_requires_program() {
        assert!(CommandMediaScanner::from_argv(&[]).is_none());

        let scanner =
            CommandMediaScanner::from_argv(&["scan".to_string(), "--quiet".to_string()]).unwrap();
        assert_eq!(scanner.program, "scan");
        assert_eq!(scanner.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn test_missing_program_is_ignored() {
        let scanner =
            CommandMediaScanner::from_argv(&["definitely-not-a-real-scanner-binary".to_string()])
                .unwrap();
        // must return immediately and never panic
        scanner.rescan(Path::new("/tmp/whatever.jpg"));
        NoopMediaScanner.rescan(Path::new("/tmp/whatever.jpg"));
    }
}
