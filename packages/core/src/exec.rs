//! # External Commands
//!
//! The transform, validate and reload steps are opaque programs. They run
//! as child processes through a [`CommandRunner`]; the default
//! [`ShellRunner`] hands the command line to a shell.
//!
//! A runner only reports what happened. Deciding that a non-zero exit is a
//! pipeline failure is the pipeline's job, which turns it into an
//! [`ExecError`] tagged with the [`Stage`] that failed.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Pipeline step an external command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Transform,
    Validate,
    Reload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Reload => "reload",
        })
    }
}

/// A command line plus what to feed it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Exit status and captured streams of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation`, capturing stdout and stderr separately
    ///
    /// `Err` means the command could not be run at all (spawn failure,
    /// timeout). A command that ran and exited non-zero is `Ok`.
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;
}

/// Runs command lines as `<shell> -c <command>`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            timeout,
        }
    }

    /// Use `$SHELL`, falling back to `/bin/sh`
    pub fn from_env(timeout: Duration) -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self::new(shell, timeout)
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&invocation.command)
            .envs(invocation.env.iter().cloned())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        // Feed stdin concurrently so a chatty child can't deadlock on a full pipe
        if let (Some(mut pipe), Some(input)) = (child.stdin.take(), invocation.stdin.clone()) {
            tokio::spawn(async move {
                // The child is free to exit without reading everything
                let _ = pipe.write_all(&input).await;
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out after {}s", self.timeout.as_secs_f64()),
                )
            })??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// An external command in the render pipeline failed
#[derive(Error, Debug, Clone)]
#[error("{stage} command failed: {reason}")]
pub struct ExecError {
    pub stage: Stage,
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
    /// What the command was given: the expanded document for transform,
    /// the candidate artifact for validate, empty for reload
    pub input: String,
}

impl ExecError {
    pub(crate) fn exited(stage: Stage, output: &CommandOutput, input: &[u8]) -> Self {
        let reason = match output.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        Self {
            stage,
            reason,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            input: String::from_utf8_lossy(input).into_owned(),
        }
    }

    pub(crate) fn not_run(stage: Stage, err: io::Error, input: &[u8]) -> Self {
        Self {
            stage,
            reason: err.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            input: String::from_utf8_lossy(input).into_owned(),
        }
    }

    /// Captured stdout followed by stderr
    pub fn output(&self) -> String {
        let mut output = self.stdout.clone();
        output.push_str(&self.stderr);
        output
    }
}
