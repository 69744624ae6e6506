//! Process strategy: run a local executable with the payload as last argument.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout};

use super::{Command, CommandError, CommandFactory};

/// Spawns `<program> <args...> <base64(payload)>`.
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    program: String,
    args: Vec<String>,
}

impl ProcessFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl CommandFactory for ProcessFactory {
    fn create(&self, payload: &[u8]) -> Box<dyn Command> {
        Box::new(ProcessCommand::new(&self.program, &self.args, payload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: &str, fixed_args: &[String], payload: &[u8]) -> Self {
        let mut args = fixed_args.to_vec();
        args.push(STANDARD.encode(payload));
        Self {
            program: program.to_string(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list, encoded payload last.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Command for ProcessCommand {
    async fn execute(self: Box<Self>) -> Result<Vec<u8>, CommandError> {
        let spawn_err = |reason: String| CommandError::Spawn {
            program: self.program.clone(),
            reason,
        };

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(spawn_err("output pipes not captured".to_string()));
        };
        let combined = read_interleaved(stdout, stderr)
            .await
            .map_err(|e| spawn_err(format!("failed reading output: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| spawn_err(e.to_string()))?;

        if status.success() {
            Ok(combined)
        } else {
            Err(CommandError::ExitStatus {
                program: self.program,
                status: status.to_string(),
                output: combined,
            })
        }
    }
}

/// Drain both pipes into one buffer, chunks in the order they arrive.
async fn read_interleaved(mut stdout: ChildStdout, mut stderr: ChildStderr) -> io::Result<Vec<u8>> {
    let mut combined = Vec::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => match n? {
                0 => out_open = false,
                n => combined.extend_from_slice(&out_buf[..n]),
            },
            n = stderr.read(&mut err_buf), if err_open => match n? {
                0 => err_open = false,
                n => combined.extend_from_slice(&err_buf[..n]),
            },
        }
    }
    Ok(combined)
}
