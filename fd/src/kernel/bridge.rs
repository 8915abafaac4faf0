//! KernelBridge - per-session kernel children with multiplexed turns
//!
//! One kernel child per `<sessionId>::provider=<providerId>` key, strictly
//! one in-flight turn per key. A second user turn while one is active is
//! written as a `pending-...` submission and acknowledged with a synthetic
//! `pending_input_queued` notice so the caller observes backpressure.
//! Every turn carries a deadline; expiry rejects the turn and kills the
//! child. Rejected turns are retried by [`KernelBridge::run_turn`] with
//! exponential backoff for the retryable error classes only.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::error::{KernelError, classify_kernel_error};
use super::process::{KernelProcess, write_submission_to};
use super::protocol::{EventMsg, InputItem, Op, Submission, TurnOptions};

/// Initial retry backoff
const BACKOFF_INITIAL_MS: u64 = 750;
/// Backoff cap
const BACKOFF_CAP_MS: u64 = 30_000;
/// How long the post-turn shutdown handshake may take
const SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Bridge tuning
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Per-turn deadline
    pub timeout_ms: u64,
    /// Retries after the first attempt (total attempts = retry_count + 1)
    pub timeout_retry_count: u32,
    /// Suppresses backoff sleeps in tests
    pub test_mode: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            timeout_retry_count: 2,
            test_mode: false,
        }
    }
}

/// A notice the bridge pushes upward (kernel passthrough events, retry
/// announcements, pending-input acknowledgements).
#[derive(Debug, Clone)]
pub struct BridgeNotice {
    pub session_id: String,
    pub kind: String,
    pub payload: Value,
}

pub type NoticeSink = Arc<dyn Fn(BridgeNotice) + Send + Sync>;

/// A resolved turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub last_agent_message: String,
    /// Events consumed for this turn, in arrival order
    pub events: Vec<EventMsg>,
    /// 1-based attempt number that succeeded
    pub attempts: u32,
}

/// Outcome of a single submission attempt
#[derive(Debug)]
pub enum TurnResponse {
    Completed(TurnResult),
    /// Another turn was active; the input was queued at the kernel
    PendingQueued { id: String },
}

struct SessionState {
    process: KernelProcess,
    disposed: bool,
}

struct SessionShared {
    key: String,
    session_id: String,
    provider_id: String,
    interrupt: Notify,
    turn_active: AtomicBool,
    seq: AtomicU64,
    writer: Arc<Mutex<tokio::process::ChildStdin>>,
    state: Mutex<SessionState>,
}

fn session_key(session_id: &str, provider_id: &str) -> String {
    format!("{}::provider={}", session_id, provider_id)
}

/// Guard that clears the turn-active flag when the turn ends
struct ActiveTurnGuard(Arc<SessionShared>);

impl Drop for ActiveTurnGuard {
    fn drop(&mut self) {
        self.0.turn_active.store(false, Ordering::SeqCst);
    }
}

/// The bridge: owner of every kernel session
pub struct KernelBridge {
    sessions: Mutex<HashMap<String, Arc<SessionShared>>>,
    config: BridgeConfig,
    notices: NoticeSink,
}

impl KernelBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            notices: Arc::new(|_| {}),
        }
    }

    pub fn with_notice_sink(mut self, sink: NoticeSink) -> Self {
        self.notices = sink;
        self
    }

    fn notify(&self, session_id: &str, kind: &str, payload: Value) {
        (self.notices)(BridgeNotice {
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            payload,
        });
    }

    /// Reuse the session's child when it is alive and was spawned from
    /// the same binary; otherwise dispose it and spawn a fresh one.
    async fn ensure_session(
        &self,
        session_id: &str,
        binary: &Path,
        provider_id: &str,
    ) -> Result<Arc<SessionShared>, KernelError> {
        let key = session_key(session_id, provider_id);
        let mut sessions = self.sessions.lock().await;

        if let Some(shared) = sessions.get(&key).cloned() {
            // A locked state means a turn is in flight, which implies a
            // live child; reuse without probing.
            let reusable = match shared.state.try_lock() {
                Err(_) => true,
                Ok(mut state) => {
                    if !state.disposed && state.process.is_alive() && state.process.binary() == binary {
                        true
                    } else {
                        debug!(%key, "ensure_session: disposing stale kernel child");
                        state.process.kill();
                        false
                    }
                }
            };
            if reusable {
                return Ok(shared);
            }
            sessions.remove(&key);
        }

        let process = KernelProcess::spawn(binary, provider_id)?;
        let writer = process.writer();
        let shared = Arc::new(SessionShared {
            key: key.clone(),
            session_id: session_id.to_string(),
            provider_id: provider_id.to_string(),
            interrupt: Notify::new(),
            turn_active: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            writer,
            state: Mutex::new(SessionState {
                process,
                disposed: false,
            }),
        });
        info!(%key, binary = %binary.display(), "kernel session spawned");
        sessions.insert(key, shared.clone());
        Ok(shared)
    }

    /// Submit one user turn. When the session already has an active turn
    /// the input is queued at the kernel instead and
    /// [`TurnResponse::PendingQueued`] is returned immediately.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        binary: &Path,
        provider_id: &str,
        prompt: &str,
        options: Option<TurnOptions>,
    ) -> Result<TurnResponse, KernelError> {
        let shared = self.ensure_session(session_id, binary, provider_id).await?;
        let seq = shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now_ms = chrono::Utc::now().timestamp_millis();

        if shared.turn_active.load(Ordering::SeqCst) {
            let id = format!("pending-{}-{}", now_ms, seq);
            let submission = Submission {
                id: id.clone(),
                op: Op::UserTurn {
                    items: vec![InputItem::text(prompt)],
                    options: options.map(Box::new),
                },
            };
            write_submission_to(&shared.writer, &submission).await?;
            debug!(key = %shared.key, %id, "turn queued as pending input");
            self.notify(
                session_id,
                "kernel_event",
                json!({"event": "pending_input_queued", "id": id}),
            );
            return Ok(TurnResponse::PendingQueued { id });
        }

        let mut state = shared.state.lock().await;
        shared.turn_active.store(true, Ordering::SeqCst);
        let _guard = ActiveTurnGuard(shared.clone());

        let turn_id = format!("turn-{}-{}", now_ms, seq);
        let submission = Submission {
            id: turn_id.clone(),
            op: Op::UserTurn {
                items: vec![InputItem::text(prompt)],
                options: options.map(Box::new),
            },
        };
        state.process.write_submission(&submission).await?;
        debug!(key = %shared.key, %turn_id, "turn submitted");

        let result = self.consume_turn(&shared, &mut state, &turn_id).await;

        match &result {
            Ok(turn) => {
                debug!(key = %shared.key, %turn_id, events = turn.events.len(), "turn resolved");
                self.shutdown_child(&shared, &mut state).await;
            }
            Err(e) => {
                warn!(key = %shared.key, %turn_id, error = %e, "turn rejected, tearing down child");
                state.process.kill();
                state.disposed = true;
            }
        }
        result.map(TurnResponse::Completed)
    }

    /// Drive the event loop for one turn until completion, error,
    /// timeout, interrupt, or child death.
    async fn consume_turn(
        &self,
        shared: &Arc<SessionShared>,
        state: &mut SessionState,
        turn_id: &str,
    ) -> Result<TurnResult, KernelError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events: Vec<EventMsg> = Vec::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(KernelError::Timeout(timeout));
                }
                _ = shared.interrupt.notified() => {
                    return Err(KernelError::Interrupted("turn interrupted by user".to_string()));
                }
                event = state.process.next_event() => {
                    let Some(event) = event else {
                        // stdout closed: the child exited (or is exiting).
                        let status = state.process.wait_exit(Duration::from_millis(500)).await;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let (code, signal) = status.unwrap_or((None, None));
                        return Err(KernelError::Fatal {
                            code,
                            signal,
                            stderr: state.process.stderr_tail(),
                        });
                    };

                    // The single session_configured event is keyed on its
                    // own id; everything else must match the active turn
                    // or a pending submission.
                    let relevant = event.id == turn_id
                        || matches!(event.msg, EventMsg::SessionConfigured { .. })
                        || event.id.starts_with("pending-");
                    if !relevant {
                        debug!(event_id = %event.id, "ignoring event for unknown id");
                        continue;
                    }

                    if event.msg.is_passthrough() {
                        self.notify(
                            &shared.session_id,
                            "kernel_event",
                            json!({"event": event.msg.kind(), "detail": event.msg}),
                        );
                    }

                    match &event.msg {
                        EventMsg::TaskComplete { last_agent_message, .. } => {
                            let message = last_agent_message.clone().unwrap_or_default();
                            events.push(event.msg.clone());
                            if message.trim().is_empty() {
                                return Err(KernelError::Malformed(
                                    "task_complete with empty last_agent_message".to_string(),
                                ));
                            }
                            return Ok(TurnResult {
                                last_agent_message: message,
                                events,
                                attempts: 1,
                            });
                        }
                        EventMsg::Error { message, response_status } => {
                            events.push(event.msg.clone());
                            return Err(classify_kernel_error(message, *response_status));
                        }
                        _ => events.push(event.msg.clone()),
                    }
                }
            }
        }
    }

    /// Post-turn graceful shutdown: `{op:{type:"shutdown"}}`, wait for
    /// `shutdown_complete`, then the child is done.
    async fn shutdown_child(&self, shared: &Arc<SessionShared>, state: &mut SessionState) {
        let seq = shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let submission = Submission {
            id: format!("turn-{}-{}", chrono::Utc::now().timestamp_millis(), seq),
            op: Op::Shutdown,
        };
        if state.process.write_submission(&submission).await.is_err() {
            state.process.kill();
            state.disposed = true;
            return;
        }

        let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(key = %shared.key, "kernel ignored shutdown; killing");
                    state.process.kill();
                    break;
                }
                event = state.process.next_event() => match event {
                    Some(event) if matches!(event.msg, EventMsg::ShutdownComplete) => break,
                    Some(_) => continue,
                    None => break,
                }
            }
        }
        state.disposed = true;
    }

    /// Submit a turn with the configured retry policy: retryable
    /// rejections (timeouts, transient failures) retry with exponential
    /// backoff; everything else surfaces immediately. A `turn_retry`
    /// notice precedes every retry.
    pub async fn run_turn(
        &self,
        session_id: &str,
        binary: &Path,
        provider_id: &str,
        prompt: &str,
        options: Option<TurnOptions>,
    ) -> Result<TurnResponse, KernelError> {
        let max_attempts = self.config.timeout_retry_count + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.submit_turn(session_id, binary, provider_id, prompt, options.clone()).await {
                Ok(TurnResponse::Completed(mut turn)) => {
                    turn.attempts = attempt;
                    return Ok(TurnResponse::Completed(turn));
                }
                Ok(queued @ TurnResponse::PendingQueued { .. }) => return Ok(queued),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay_ms = (BACKOFF_INITIAL_MS << (attempt - 1)).min(BACKOFF_CAP_MS);
                    warn!(%session_id, attempt, delay_ms, error = %e, "turn failed, retrying");
                    self.notify(
                        session_id,
                        "turn_retry",
                        json!({"attempt": attempt, "retryDelayMs": delay_ms, "error": e.to_string()}),
                    );
                    if !self.config.test_mode {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reject the session's active turn with a user-interruption error
    /// and dispose its child; pending turns are cancelled with it.
    pub async fn interrupt_session(&self, session_id: &str, provider_id: Option<&str>) {
        let sessions = self.sessions.lock().await;
        for shared in sessions.values() {
            let session_matches = shared.session_id == session_id
                && provider_id.is_none_or(|p| shared.provider_id == p);
            if !session_matches {
                continue;
            }
            info!(key = %shared.key, "interrupting kernel session");
            if shared.turn_active.load(Ordering::SeqCst) {
                // The active turn's select loop observes the notify, then
                // tears the child down itself.
                shared.interrupt.notify_one();
            } else if let Ok(mut state) = shared.state.try_lock() {
                state.process.kill();
                state.disposed = true;
            }
        }
    }

    /// Dispose a session outright (fresh-session-per-round policy)
    pub async fn dispose_session(&self, session_id: &str, provider_id: &str) {
        let key = session_key(session_id, provider_id);
        let mut sessions = self.sessions.lock().await;
        if let Some(shared) = sessions.remove(&key) {
            debug!(%key, "disposing kernel session");
            if let Ok(mut state) = shared.state.try_lock() {
                state.process.kill();
                state.disposed = true;
            } else {
                shared.interrupt.notify_one();
            }
        }
    }

    /// Number of tracked session entries (live or disposed-but-cached)
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::testing::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn test_bridge(timeout_ms: u64, retries: u32) -> (Arc<KernelBridge>, Arc<StdMutex<Vec<BridgeNotice>>>) {
        let notices: Arc<StdMutex<Vec<BridgeNotice>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_store = notices.clone();
        let bridge = KernelBridge::new(BridgeConfig {
            timeout_ms,
            timeout_retry_count: retries,
            test_mode: true,
        })
        .with_notice_sink(Arc::new(move |notice| {
            sink_store.lock().unwrap().push(notice);
        }));
        (Arc::new(bridge), notices)
    }

    #[tokio::test]
    async fn test_successful_turn_resolves_with_message() {
        let temp = tempdir().unwrap();
        let binary = echoing_kernel(temp.path(), "all done");
        let (bridge, _) = test_bridge(5_000, 0);

        let response = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap();
        match response {
            TurnResponse::Completed(turn) => {
                assert_eq!(turn.last_agent_message, "all done");
                assert_eq!(turn.attempts, 1);
                assert!(turn.events.iter().any(|e| e.kind() == "task_started"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_agent_message_is_malformed() {
        let temp = tempdir().unwrap();
        let binary = empty_message_kernel(temp.path());
        let (bridge, _) = test_bridge(5_000, 0);

        let err = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_timeout_retries_then_fails() {
        let temp = tempdir().unwrap();
        let binary = silent_kernel(temp.path());
        let (bridge, notices) = test_bridge(200, 2);

        let err = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Timeout(_)));
        assert!(err.to_string().contains("timed out"));

        // Exactly two retry notices, with doubling nominal delays.
        let retries: Vec<BridgeNotice> = notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == "turn_retry")
            .cloned()
            .collect();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].payload["retryDelayMs"], 750);
        assert_eq!(retries[1].payload["retryDelayMs"], 1500);
    }

    #[tokio::test]
    async fn test_transient_status_retries() {
        let temp = tempdir().unwrap();
        let binary = erroring_kernel(temp.path(), 503);
        let (bridge, notices) = test_bridge(5_000, 1);

        let err = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Transient { status: Some(503), .. }));
        let retry_count = notices.lock().unwrap().iter().filter(|n| n.kind == "turn_retry").count();
        assert_eq!(retry_count, 1);
    }

    #[tokio::test]
    async fn test_auth_error_never_retries() {
        let temp = tempdir().unwrap();
        let binary = erroring_kernel(temp.path(), 401);
        let (bridge, notices) = test_bridge(5_000, 3);

        let err = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Unauthorized(_)));
        assert_eq!(notices.lock().unwrap().iter().filter(|n| n.kind == "turn_retry").count(), 0);
    }

    #[tokio::test]
    async fn test_dead_child_is_fatal_with_stderr() {
        let temp = tempdir().unwrap();
        let binary = dying_kernel(temp.path(), 9);
        let (bridge, _) = test_bridge(5_000, 0);

        let err = bridge
            .run_turn("sess-1", &binary, "prov-a", "do it", None)
            .await
            .unwrap_err();
        match err {
            KernelError::Fatal { stderr, .. } => assert!(stderr.contains("kernel exploded")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_turn_while_active_is_queued() {
        let temp = tempdir().unwrap();
        // A kernel that waits before completing, leaving a window for the
        // second submission.
        let binary = script_kernel(
            temp.path(),
            r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"shutdown"'*)
      printf '{"id":"%s","msg":{"type":"shutdown_complete"}}\n' "$id"
      exit 0
      ;;
  esac
  case "$id" in
    pending-*) : ;;
    *)
      sleep 1
      printf '{"id":"%s","msg":{"type":"task_complete","last_agent_message":"slow done"}}\n' "$id"
      ;;
  esac
done"#,
        );
        let (bridge, notices) = test_bridge(10_000, 0);

        let bridge_for_task = bridge.clone();
        let binary_for_task = binary.clone();
        let first = tokio::spawn(async move {
            bridge_for_task
                .submit_turn("sess-1", &binary_for_task, "prov-a", "long task", None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = bridge
            .submit_turn("sess-1", &binary, "prov-a", "queued task", None)
            .await
            .unwrap();
        match second {
            TurnResponse::PendingQueued { id } => assert!(id.starts_with("pending-")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(
            notices
                .lock()
                .unwrap()
                .iter()
                .any(|n| n.payload["event"] == "pending_input_queued")
        );

        let first = first.await.unwrap().unwrap();
        match first {
            TurnResponse::Completed(turn) => assert_eq!(turn.last_agent_message, "slow done"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interrupt_rejects_active_turn() {
        let temp = tempdir().unwrap();
        let binary = silent_kernel(temp.path());
        let (bridge, _) = test_bridge(30_000, 0);

        let bridge_for_task = bridge.clone();
        let binary_for_task = binary.clone();
        let turn = tokio::spawn(async move {
            bridge_for_task
                .submit_turn("sess-1", &binary_for_task, "prov-a", "never finishes", None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        bridge.interrupt_session("sess-1", None).await;

        let err = turn.await.unwrap().unwrap_err();
        assert!(err.is_interrupt());
        assert!(err.to_string().contains("interrupted"));
    }

    #[tokio::test]
    async fn test_session_respawns_after_successful_turn() {
        let temp = tempdir().unwrap();
        let binary = echoing_kernel(temp.path(), "ok");
        let (bridge, _) = test_bridge(5_000, 0);

        for _ in 0..2 {
            let response = bridge
                .run_turn("sess-1", &binary, "prov-a", "go", None)
                .await
                .unwrap();
            assert!(matches!(response, TurnResponse::Completed(_)));
        }
        // Still a single tracked session key.
        assert_eq!(bridge.session_count().await, 1);
    }
}
