// src/execution/mod.rs

//! Bounded execution of external host tools (cryptsetup, mount, qemu-img,
//! tpm2-tools). Every invocation is wrapped in a timeout so a wedged tool
//! surfaces as an error instead of blocking the hypervisor hook forever.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub status: i32,

    /// Raw standard output; wiped on drop as some tools print key material
    pub stdout: Zeroizing<Vec<u8>>,

    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Standard output as text
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Most useful diagnostic line: stderr when present, stdout otherwise
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout_text = self.stdout_text();
        let stdout = stdout_text.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            "no additional output".to_string()
        }
    }
}

/// Program plus arguments, kept together for logging and fakes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to execute
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Creates an invocation without arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends one argument
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Appends a path argument
    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Sets an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// File name of the program, used to match invocations in logs and fakes
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `invocation` to completion, feeding `stdin` when given
    async fn run(&self, invocation: &Invocation, stdin: Option<&[u8]>) -> Result<CommandOutput, CommandError>;
}

/// Command runner backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    /// Timeout applied to each command
    timeout: Duration,
}

impl SystemCommandRunner {
    /// Creates a runner with the given per-command timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &Invocation, stdin: Option<&[u8]>) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| CommandError::SpawnFailed {
            program: invocation.program_name(),
            error: e.to_string(),
        })?;

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(payload).await.map_err(|e| CommandError::Io {
                    program: invocation.program_name(),
                    error: e.to_string(),
                })?;
                // Closing stdin signals EOF to tools reading a key file from "-"
                drop(pipe);
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CommandError::Io {
                program: invocation.program_name(),
                error: e.to_string(),
            })?,
            Err(_) => {
                warn!("{} timed out after {:?}", invocation, self.timeout);
                return Err(CommandError::TimedOut {
                    program: invocation.program_name(),
                    timeout: self.timeout,
                });
            }
        };

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: Zeroizing::new(output.stdout),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            command = %invocation,
            status = result.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "External command finished"
        );

        Ok(result)
    }
}

/// Errors raised while running external commands
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {error}")]
    SpawnFailed {
        program: String,
        error: String,
    },

    #[error("I/O error talking to {program}: {error}")]
    Io {
        program: String,
        error: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
    },
}
