//! KernelProcess - one long-lived kernel child over stdio
//!
//! Owns the child handle, a writer half (stdin behind a lock so pending
//! submissions can be written while a turn is in flight), and a
//! line-reader task that parses each stdout line into a [`KernelEvent`]
//! and forwards it on a channel. Stderr is captured into a bounded tail
//! for post-mortem error messages.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::error::KernelError;
use super::protocol::{KernelEvent, Submission};

/// Bytes of stderr retained for error reporting
const STDERR_TAIL_BYTES: usize = 4096;

/// Environment variable carrying the provider identifier to the child
pub const PROVIDER_ENV: &str = "FINGER_PROVIDER";

pub struct KernelProcess {
    binary: PathBuf,
    provider_id: String,
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    events: mpsc::UnboundedReceiver<KernelEvent>,
    stderr_tail: Arc<StdMutex<Vec<u8>>>,
}

impl KernelProcess {
    /// Spawn the kernel binary with the provider id in its environment
    pub fn spawn(binary: &Path, provider_id: &str) -> Result<Self, KernelError> {
        debug!(binary = %binary.display(), %provider_id, "KernelProcess::spawn");
        let mut child = Command::new(binary)
            .env(PROVIDER_ENV, provider_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::Protocol("kernel child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::Protocol("kernel child has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KernelError::Protocol("kernel child has no stderr".to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<KernelEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line.chars().take(200).collect::<String>(), "unparseable kernel line"),
                }
            }
            debug!("kernel stdout closed");
        });

        let stderr_tail = Arc::new(StdMutex::new(Vec::new()));
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = tail.lock().unwrap_or_else(|e| e.into_inner());
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                let excess = buf.len().saturating_sub(STDERR_TAIL_BYTES);
                if excess > 0 {
                    buf.drain(..excess);
                }
            }
        });

        Ok(Self {
            binary: binary.to_path_buf(),
            provider_id: provider_id.to_string(),
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            events: event_rx,
            stderr_tail,
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// A clone of the writer half, for pending submissions written while
    /// a turn holds the process.
    pub fn writer(&self) -> Arc<Mutex<ChildStdin>> {
        self.stdin.clone()
    }

    /// Write one submission as a single line
    pub async fn write_submission(&self, submission: &Submission) -> Result<(), KernelError> {
        write_submission_to(&self.stdin, submission).await
    }

    /// Receive the next kernel event; `None` means the child's stdout
    /// closed (it exited or is exiting).
    pub async fn next_event(&mut self) -> Option<KernelEvent> {
        self.events.recv().await
    }

    /// Whether the child is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code / signal, if the child has exited
    pub fn exit_status(&mut self) -> Option<(Option<i32>, Option<i32>)> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(split_status(status)),
            _ => None,
        }
    }

    /// Wait (bounded) for the child to exit; also gives the stderr reader
    /// time to drain its pipe before the tail is sampled.
    pub async fn wait_exit(&mut self, timeout: std::time::Duration) -> Option<(Option<i32>, Option<i32>)> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tokio::task::yield_now().await;
                Some(split_status(status))
            }
            _ => None,
        }
    }

    /// The captured stderr tail, lossily decoded
    pub fn stderr_tail(&self) -> String {
        let buf = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Kill the child immediately
    pub fn kill(&mut self) {
        debug!(binary = %self.binary.display(), "KernelProcess::kill");
        let _ = self.child.start_kill();
    }
}

fn split_status(status: std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}

/// Write a submission line through a shared writer half
pub async fn write_submission_to(
    stdin: &Arc<Mutex<ChildStdin>>,
    submission: &Submission,
) -> Result<(), KernelError> {
    let line = serde_json::to_string(submission)? + "\n";
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

#[cfg(test)]
pub mod testing {
    //! Scripted stand-in kernels for tests: small shell scripts speaking
    //! the line protocol.

    use std::path::PathBuf;

    /// Write an executable script into `dir` and return its path
    pub fn script_kernel(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("mock-kernel.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A kernel that answers every user turn with a canned completion and
    /// honors shutdown.
    pub fn echoing_kernel(dir: &std::path::Path, message: &str) -> PathBuf {
        let body = format!(
            r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"shutdown"'*)
      printf '{{"id":"%s","msg":{{"type":"shutdown_complete"}}}}\n' "$id"
      exit 0
      ;;
    *)
      printf '{{"id":"%s","msg":{{"type":"task_started"}}}}\n' "$id"
      printf '{{"id":"%s","msg":{{"type":"task_complete","last_agent_message":"{}"}}}}\n' "$id"
      ;;
  esac
done"#,
            message
        );
        script_kernel(dir, &body)
    }

    /// A kernel that reads input but never responds (for timeout tests)
    pub fn silent_kernel(dir: &std::path::Path) -> PathBuf {
        script_kernel(dir, "cat > /dev/null")
    }

    /// A kernel that exits immediately with the given code
    pub fn dying_kernel(dir: &std::path::Path, code: i32) -> PathBuf {
        script_kernel(dir, &format!("echo 'kernel exploded' >&2\nexit {}", code))
    }

    /// A kernel that completes turns with an empty agent message
    pub fn empty_message_kernel(dir: &std::path::Path) -> PathBuf {
        script_kernel(
            dir,
            r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","msg":{"type":"task_complete","last_agent_message":""}}\n' "$id"
done"#,
        )
    }

    /// A kernel that reports a kernel-side error with a status code
    pub fn erroring_kernel(dir: &std::path::Path, status: u16) -> PathBuf {
        script_kernel(
            dir,
            &format!(
                r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  printf '{{"id":"%s","msg":{{"type":"error","message":"upstream failure","response_status":{}}}}}\n' "$id"
done"#,
                status
            ),
        )
    }
}
