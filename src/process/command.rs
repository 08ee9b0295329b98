use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ParamedicError;

/// Exit status and captured output of a finished external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub command: String,
    /// `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_contains(&self, marker: &str) -> bool {
        self.stdout.contains(marker)
    }

    /// Turn a non-zero exit into `CommandFailed`.
    pub fn check(self) -> Result<Self, ParamedicError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ParamedicError::CommandFailed {
                command: self.command,
                code: self.code.unwrap_or(-1),
            })
        }
    }
}

/// Run `program args...` to completion, streaming each output line to the
/// debug log while collecting it.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<CommandOutput, ParamedicError> {
    let command_line = describe(program, args);
    info!("paramedic: running `{}`", command_line);

    let mut cmd = command_for(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        ParamedicError::Process(format!("Failed to spawn `{}`: {}", command_line, e))
    })?;

    let stdout = child.stdout.take().map(|s| spawn_line_reader(s, "stdout"));
    let stderr = child.stderr.take().map(|s| spawn_line_reader(s, "stderr"));

    let status = child.wait().await?;
    let output = CommandOutput {
        command: command_line,
        code: status.code(),
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    };
    debug!("`{}` exited with {:?}", output.command, output.code);
    Ok(output)
}

/// Like [`run`], but the process is killed once `limit` elapses.
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<CommandOutput, ParamedicError> {
    match tokio::time::timeout(limit, run(program, args, cwd)).await {
        Ok(result) => result,
        Err(_) => Err(ParamedicError::Timeout(format!(
            "`{}` did not finish within {:?}",
            describe(program, args),
            limit
        ))),
    }
}

/// Start `program args...` and leave it running in the background. Its
/// output is discarded.
pub fn spawn_detached(program: &str, args: &[String]) -> Result<(), ParamedicError> {
    let command_line = describe(program, args);
    info!("paramedic: starting `{}` in the background", command_line);
    command_for(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ParamedicError::Process(format!("Failed to spawn `{}`: {}", command_line, e)))?;
    Ok(())
}

pub fn describe(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// npm-installed CLIs are `.cmd` shims on Windows and need the shell.
#[cfg(windows)]
fn command_for(program: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", program]);
    cmd
}

#[cfg(not(windows))]
fn command_for(program: &str) -> Command {
    Command::new(program)
}

fn spawn_line_reader<R>(reader: R, stream: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut captured = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(stream = stream, "{}", line);
                    captured.push_str(&line);
                    captured.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading {}: {}", stream, e);
                    break;
                }
            }
        }
        captured
    })
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
