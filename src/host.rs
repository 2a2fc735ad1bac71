//! Host access
//!
//! Bundles the command runner with the filesystem root every `/sys`, `/etc`
//! path is resolved against, so the whole core can be pointed at a
//! temporary directory.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::exec::{Cmd, CmdOutput, CommandRunner, DryRunRunner, SystemRunner};

#[derive(Clone)]
pub struct Host {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    read_only: bool,
}

impl Host {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
            read_only: false,
        }
    }

    /// The real machine
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner), "/")
    }

    /// Real filesystem reads; commands and file writes are only logged
    pub fn dry_run() -> Self {
        Self {
            read_only: true,
            ..Self::new(Arc::new(DryRunRunner), "/")
        }
    }

    /// Resolve an absolute system path under this host's root
    pub fn path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    /// Run a command. A non-zero exit of a critical command is an error;
    /// otherwise it is logged (unless expected) and reported as `false`.
    pub async fn run(&self, cmd: Cmd, critical: bool) -> Result<bool, LinkError> {
        debug!(command = %cmd, critical, "Running command");

        let output = match self.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) if critical => return Err(e),
            Err(e) => {
                if cmd.expected_to_fail() {
                    debug!(command = %cmd, error = %e, "Command did not run");
                } else {
                    warn!(command = %cmd, error = %e, "Command did not run");
                }
                return Ok(false);
            }
        };

        if output.success() {
            return Ok(true);
        }

        if critical {
            return Err(LinkError::CommandFailure {
                command: cmd.line(),
                code: output.code,
                output: output.diagnostic().to_string(),
            });
        }

        if cmd.expected_to_fail() {
            debug!(command = %cmd, rc = ?output.code, "Command failed (expected)");
        } else {
            warn!(
                command = %cmd,
                rc = ?output.code,
                output = %output.diagnostic(),
                "Command failed"
            );
        }
        Ok(false)
    }

    /// Run a best-effort command whose outcome is not worth a warning
    pub async fn succeeds(&self, cmd: Cmd) -> bool {
        matches!(self.run(cmd.may_fail(), false).await, Ok(true))
    }

    /// Run a command for its stdout. `None` when it could not run or exited
    /// non-zero.
    pub async fn output(&self, cmd: Cmd) -> Option<CmdOutput> {
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => Some(output),
            Ok(output) => {
                debug!(command = %cmd, rc = ?output.code, "Query command failed");
                None
            }
            Err(e) => {
                debug!(command = %cmd, error = %e, "Query command did not run");
                None
            }
        }
    }

    pub fn exists(&self, absolute: &str) -> bool {
        self.path(absolute).exists()
    }

    /// Read a file, trimmed; `None` if it cannot be read
    pub async fn read_trimmed(&self, absolute: &str) -> Option<String> {
        tokio::fs::read_to_string(self.path(absolute))
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Read a file; a missing file reads as empty
    pub async fn read_or_empty(&self, absolute: &str) -> Result<String, LinkError> {
        match tokio::fs::read_to_string(self.path(absolute)).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(LinkError::Io {
                path: absolute.to_string(),
                source,
            }),
        }
    }

    /// Write `contents` unless the file already exists. Returns whether it
    /// was written.
    pub async fn write_if_absent(&self, absolute: &str, contents: &str) -> Result<bool, LinkError> {
        if self.exists(absolute) {
            debug!(path = absolute, "File already present, leaving it alone");
            return Ok(false);
        }
        self.rewrite(absolute, contents).await?;
        Ok(true)
    }

    /// Replace the whole file (not atomic)
    pub async fn rewrite(&self, absolute: &str, contents: &str) -> Result<(), LinkError> {
        if self.read_only {
            info!(path = absolute, bytes = contents.len(), "Would write file (dry run)");
            return Ok(());
        }

        let path = self.path(absolute);
        let io_error = |source| LinkError::Io {
            path: absolute.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&path, contents).await.map_err(io_error)?;
        debug!(path = absolute, "Wrote file");
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("root", &self.root)
            .field("read_only", &self.read_only)
            .finish()
    }
}
