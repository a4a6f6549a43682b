// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A long-lived child shell that preserves environment, shell variables, and
//! working directory across commands within a session, with containment:
//! the working directory is never allowed to drift outside the directory the
//! shell was opened in.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-command timeout applied when a caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell has been closed")]
    Closed,
    #[error("shell process died")]
    ShellDied,
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("shell escaped its containment and could not be reset: {0}")]
    ContainmentFailure(String),
    #[error("cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// External decision oracle consulted before a command is framed and sent to
/// the child. Mirrors the registry's `PermissionOracle` shape but scoped to
/// raw command strings.
pub trait CommandValidator: Send + Sync {
    fn validate(&self, command: &str) -> Result<(), String>;
}

/// Accepts every command. The default when no policy is wired in.
pub struct AllowAllCommands;

impl CommandValidator for AllowAllCommands {
    fn validate(&self, _command: &str) -> Result<(), String> {
        Ok(())
    }
}

/// The result of executing one command in a persistent shell.
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub working_dir: PathBuf,
}

struct Handle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_buf: Arc<StdMutex<String>>,
}

/// A single persistent shell. `open` and `closed` are the only two states;
/// the transition is one-way.
pub struct Shell {
    handle: Mutex<Option<Handle>>,
    original_directory: PathBuf,
    current_directory: Mutex<PathBuf>,
    closed: std::sync::atomic::AtomicBool,
}

impl Shell {
    /// Spawn the child shell, recording the process's current working
    /// directory as the containment boundary for every subsequent command.
    pub async fn open() -> Result<Self, ShellError> {
        let original_directory = std::env::current_dir()?;
        let handle = spawn_shell(&original_directory)?;
        debug!(dir = %original_directory.display(), "opened persistent shell");
        Ok(Self {
            handle: Mutex::new(Some(handle)),
            current_directory: Mutex::new(original_directory.clone()),
            original_directory,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn original_directory(&self) -> &Path {
        &self.original_directory
    }

    pub async fn current_directory(&self) -> PathBuf {
        self.current_directory.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Execute one command, honoring `timeout` and cooperative cancellation
    /// via `token`. Serializes against any other in-flight command on this
    /// shell — at most one command runs at a time.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        token: &CancellationToken,
        validator: &dyn CommandValidator,
    ) -> Result<ShellResult, ShellError> {
        if self.is_closed() {
            return Err(ShellError::Closed);
        }
        validator.validate(command).map_err(ShellError::Rejected)?;

        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut().ok_or(ShellError::Closed)?;

        if probe_dead(&mut handle.child) {
            self.mark_closed();
            return Err(ShellError::ShellDied);
        }

        let marker = random_marker();
        let framed = format!("{command}\necho EXIT_CODE:$?:{marker}\n");

        let run = async {
            handle.stdin.write_all(framed.as_bytes()).await?;
            handle.stdin.flush().await?;
            read_until_marker(&mut handle.stdout, &marker).await
        };

        let (output, exit_code) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ShellError::Cancelled),
            res = tokio::time::timeout(timeout, run) => match res {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ShellError::Timeout(timeout)),
            },
        };

        // Drained after the `pwd` round-trip below rather than immediately: that
        // extra await gives the background stderr task a scheduling point to
        // catch up before this command's output is finalized.
        let refreshed = self.refresh_working_dir(handle, token, timeout).await?;

        let stderr = drain_stderr_nonblocking(handle);

        Ok(ShellResult {
            output,
            error: stderr,
            exit_code,
            working_dir: refreshed,
        })
    }

    /// Re-probe `pwd`, enforcing containment: if the shell has drifted
    /// outside `original_directory`, issue a `cd` back and re-check. If the
    /// reset itself fails the shell is marked closed.
    async fn refresh_working_dir(
        &self,
        handle: &mut Handle,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<PathBuf, ShellError> {
        let dir = self.probe_pwd(handle, token, timeout).await?;

        if is_contained(&self.original_directory, &dir) {
            *self.current_directory.lock().await = dir.clone();
            return Ok(dir);
        }

        warn!(dir = %dir.display(), original = %self.original_directory.display(), "shell escaped containment, resetting");
        let cd_cmd = format!("cd {}", shell_quote(&self.original_directory));
        let marker = random_marker();
        let framed = format!("{cd_cmd}\necho EXIT_CODE:$?:{marker}\n");
        let reset = async {
            handle.stdin.write_all(framed.as_bytes()).await?;
            handle.stdin.flush().await?;
            read_until_marker(&mut handle.stdout, &marker).await
        };
        let reset_result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ShellError::Cancelled),
            res = tokio::time::timeout(timeout, reset) => match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(ShellError::Io(e)),
                Err(_) => Err(ShellError::Timeout(timeout)),
            },
        };

        match reset_result {
            Ok((_, code)) if code == 0 => {
                let dir = self.probe_pwd(handle, token, timeout).await?;
                if is_contained(&self.original_directory, &dir) {
                    *self.current_directory.lock().await = dir.clone();
                    Ok(dir)
                } else {
                    drop(handle);
                    self.mark_closed();
                    Err(ShellError::ContainmentFailure(format!(
                        "reset to {} but pwd reports {}",
                        self.original_directory.display(),
                        dir.display()
                    )))
                }
            }
            Ok((out, code)) => {
                drop(handle);
                self.mark_closed();
                Err(ShellError::ContainmentFailure(format!(
                    "cd back to {} failed (exit {code}): {out}",
                    self.original_directory.display()
                )))
            }
            Err(e) => {
                drop(handle);
                self.mark_closed();
                Err(ShellError::ContainmentFailure(e.to_string()))
            }
        }
    }

    async fn probe_pwd(
        &self,
        handle: &mut Handle,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<PathBuf, ShellError> {
        let marker = random_marker();
        let framed = format!("pwd\necho EXIT_CODE:$?:{marker}\n");
        let run = async {
            handle.stdin.write_all(framed.as_bytes()).await?;
            handle.stdin.flush().await?;
            read_until_marker(&mut handle.stdout, &marker).await
        };
        let (out, _code) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ShellError::Cancelled),
            res = tokio::time::timeout(timeout, run) => match res {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ShellError::Timeout(timeout)),
            },
        };
        Ok(PathBuf::from(out.trim()))
    }

    fn mark_closed(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Close stdin, wait briefly for a graceful exit, then kill.
    pub async fn close(&self) {
        self.mark_closed();
        let mut guard = self.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            let _ = handle.stdin.shutdown().await;
            let wait = tokio::time::timeout(Duration::from_millis(500), handle.child.wait()).await;
            if wait.is_err() {
                let _ = handle.child.kill().await;
            }
        }
    }
}

fn probe_dead(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(Some(_)) | Err(_))
}

fn spawn_shell(cwd: &Path) -> Result<Handle, ShellError> {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg("--noprofile").arg("--norc");
    cmd.current_dir(cwd);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take().ok_or(ShellError::ShellDied)?;
    let stdout = BufReader::new(child.stdout.take().ok_or(ShellError::ShellDied)?);
    let stderr_buf = Arc::new(StdMutex::new(String::new()));
    // stderr is drained continuously on a background task so a chatty
    // subprocess never blocks the marker protocol reading stdout; bytes
    // accumulate in `stderr_buf` until a command drains them below.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr_task(stderr, stderr_buf.clone()));
    }
    Ok(Handle { child, stdin, stdout, stderr_buf })
}

/// Reads stdout lines until one equals exactly `EXIT_CODE:<code>:<marker>`.
/// Requiring equality rather than a substring match means a program that
/// happens to print the marker text as ordinary output can't fool the
/// reader into stopping early.
async fn read_until_marker(
    stdout: &mut BufReader<ChildStdout>,
    marker: &str,
) -> std::io::Result<(String, i32)> {
    let mut output = String::new();
    let prefix = "EXIT_CODE:";
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).await?;
        if n == 0 {
            return Ok((output, -1));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            if let Some((code_str, tail)) = rest.split_once(':') {
                if tail == marker {
                    let code = code_str.parse::<i32>().unwrap_or(-1);
                    return Ok((output, code));
                }
            }
        }
        output.push_str(&line);
    }
}

fn random_marker() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("turnloop_{n:016x}")
}

fn is_contained(original: &Path, candidate: &Path) -> bool {
    candidate == original || candidate.starts_with(original)
}

fn shell_quote(p: &Path) -> String {
    format!("'{}'", p.display().to_string().replace('\'', "'\\''"))
}

// Stderr is drained on a dedicated task so a chatty subprocess never blocks
// the marker protocol reading stdout. Since stderr doesn't carry the exit
// marker, `drain_stderr_nonblocking` takes whatever has accumulated in
// `stderr_buf` since the last call and leaves the buffer empty for the next
// command.
fn drain_stderr_nonblocking(handle: &mut Handle) -> String {
    std::mem::take(&mut *handle.stderr_buf.lock().unwrap())
}

async fn drain_stderr_task(mut stderr: tokio::process::ChildStderr, buf: Arc<StdMutex<String>>) {
    use tokio::io::AsyncReadExt;
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                buf.lock().unwrap().push_str(&text);
            }
        }
    }
}
