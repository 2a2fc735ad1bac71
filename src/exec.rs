//! Command execution
//!
//! Every kernel and network interaction goes through an external command.
//! [`Cmd`] describes one invocation, [`CommandRunner`] is the seam that
//! actually spawns it. [`SystemRunner`] is the real implementation;
//! [`DryRunRunner`] only logs what would run.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::LinkError;

/// A single external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    timeout: Option<Duration>,
    may_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
            may_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the command's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Mark the command as expected to fail sometimes (no warning on failure)
    pub fn may_fail(mut self) -> Self {
        self.may_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn expected_to_fail(&self) -> bool {
        self.may_fail
    }

    /// The command as it would be typed in a shell
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr if there is any, stdout otherwise
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Trait for command execution
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is an `Ok` output;
    /// only spawn failures and timeouts are errors.
    async fn run(&self, cmd: &Cmd) -> Result<CmdOutput, LinkError>;
}

/// Spawns real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &Cmd) -> Result<CmdOutput, LinkError> {
        let spawn_error = |source| LinkError::Spawn {
            command: cmd.line(),
            source,
        };

        let mut command = tokio::process::Command::new(cmd.program());
        command
            .args(cmd.arguments())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin_data().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(spawn_error)?;

        if let (Some(input), Some(mut stdin)) = (cmd.stdin_data(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_error)?;
            // stdin is closed on drop so the child sees EOF
        }

        let wait = child.wait_with_output();
        let output = match cmd.time_limit() {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| LinkError::Timeout {
                    command: cmd.line(),
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => wait.await,
        }
        .map_err(spawn_error)?;

        let result = CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %cmd, rc = ?result.code, "Command finished");
        Ok(result)
    }
}

/// Logs commands instead of running them; every command "succeeds"
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunRunner;

#[async_trait::async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, cmd: &Cmd) -> Result<CmdOutput, LinkError> {
        info!(command = %cmd, "Would run command (dry run)");
        Ok(CmdOutput::ok(""))
    }
}
