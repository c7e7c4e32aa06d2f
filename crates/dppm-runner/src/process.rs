use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process io: {0}")]
    Io(#[from] std::io::Error),

    #[error("process timed out after {0:?}")]
    TimedOut(Duration),
}

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A child process running in its own process group, so the whole tree can
/// be signalled at once.
pub struct ManagedChild {
    child: tokio::process::Child,
    pgid: i32,
}

impl ManagedChild {
    /// SIGTERM the process group, wait `grace_period`, then SIGKILL.
    pub async fn kill_group(&mut self, grace_period: Duration) {
        if let Err(e) = kill(Pid::from_raw(-self.pgid), Signal::SIGTERM) {
            // ESRCH: already gone
            if e != nix::errno::Errno::ESRCH {
                warn!("SIGTERM to process group {} failed: {e}", self.pgid);
            }
            return;
        }

        if tokio::time::timeout(grace_period, self.child.wait())
            .await
            .is_err()
        {
            if let Err(e) = kill(Pid::from_raw(-self.pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("SIGKILL to process group {} failed: {e}", self.pgid);
                }
            }
            let _ = self.child.wait().await;
        }
    }
}

impl Drop for ManagedChild {
    // A dropped future (cancelled run, outer timeout) must not leak the tree.
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = kill(Pid::from_raw(-self.pgid), Signal::SIGKILL);
        }
    }
}

type Pipes = (ChildStdout, ChildStderr, Option<ChildStdin>);

/// Spawn `cmd` in a new session so it leads its own process group.
fn spawn_managed(cmd: &mut Command, with_stdin: bool) -> Result<(ManagedChild, Pipes), ProcessError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    if with_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
    let pid = child.id().ok_or_else(|| {
        ProcessError::Io(std::io::Error::other("child exited before its pid was read"))
    })? as i32;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Io(std::io::Error::other("stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::Io(std::io::Error::other("stderr not captured")))?;
    let stdin = child.stdin.take();

    Ok((ManagedChild { child, pgid: pid }, (stdout, stderr, stdin)))
}

/// Run `cmd` to completion, feeding `input` on stdin when given. If the
/// timeout fires the whole process group is killed (SIGTERM, grace, SIGKILL).
pub async fn run_managed(
    cmd: &mut Command,
    input: Option<Vec<u8>>,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let (mut managed, (mut stdout, mut stderr, stdin)) = spawn_managed(cmd, input.is_some())?;

    let result = tokio::time::timeout(timeout, async {
        let mut stdout_bytes = Vec::new();
        let mut stderr_bytes = Vec::new();

        let feed = async {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                // The child may exit without reading; a broken pipe is not our failure.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            }
            Ok::<_, std::io::Error>(())
        };

        let (_, _, _, status) = tokio::try_join!(
            feed,
            stdout.read_to_end(&mut stdout_bytes),
            stderr.read_to_end(&mut stderr_bytes),
            managed.child.wait()
        )?;
        Ok::<_, std::io::Error>((stdout_bytes, stderr_bytes, status))
    })
    .await;

    match result {
        Ok(Ok((stdout_bytes, stderr_bytes, status))) => Ok(ProcessOutput {
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
            stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
            exit_code: status.code().unwrap_or(-1),
        }),
        Ok(Err(e)) => Err(ProcessError::Io(e)),
        Err(_elapsed) => {
            info!("process timed out after {timeout:?}, killing process group");
            managed.kill_group(kill_grace).await;
            Err(ProcessError::TimedOut(timeout))
        }
    }
}
