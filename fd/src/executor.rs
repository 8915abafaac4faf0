//! Executor loop - runs one dispatched task to a verdict
//!
//! Wraps every registry action so each execution also synchronizes the
//! external tracker (close on COMPLETE, block on FAIL, comment
//! otherwise) and emits a `loop.node.updated` event per completed
//! action. The wrapper never changes an action's verdict.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionContext, ActionRegistry, ActionResult, StopReason, standard_registry};
use crate::events::{Event, EventBus};
use crate::react::{Agent, ReactConfig, ReactLoop, ReactStatus, SnapshotSink, StopConditions};
use crate::tracker::Tracker;

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_iterations: u32,
    /// Executors default to a fresh kernel session each round to bound
    /// context growth
    pub fresh_session_per_round: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fresh_session_per_round: true,
        }
    }
}

/// The executor's verdict on one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub observation: String,
    pub rounds: u32,
    pub error: Option<String>,
}

/// Registry action wrapped with tracker synchronization and progress
/// events. Side effects run after the primitive action; its verdict is
/// passed through untouched.
struct TrackedAction {
    inner: Arc<dyn Action>,
    tracker: Arc<dyn Tracker>,
    bus: Arc<EventBus>,
    bd_task_id: Option<String>,
    agent_id: String,
    session_id: String,
    workflow_id: Option<String>,
}

#[async_trait]
impl Action for TrackedAction {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn params_schema(&self) -> Value {
        self.inner.params_schema()
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let result = self.inner.execute(params, ctx).await;

        if let Some(bd_id) = &self.bd_task_id {
            let sync = match (&result.stop_reason, result.success) {
                (Some(StopReason::Complete), true) => {
                    self.tracker.close_task(bd_id, &result.observation_or_error()).await
                }
                (Some(StopReason::Fail), _) => {
                    self.tracker
                        .block_task(bd_id, result.error.as_deref().unwrap_or("failed"))
                        .await
                }
                _ => {
                    let observation = result.observation_or_error();
                    if observation.is_empty() {
                        Ok(())
                    } else {
                        self.tracker
                            .add_comment(bd_id, &format!("[{}] {}", self.inner.name(), observation))
                            .await
                    }
                }
            };
            if let Err(e) = sync {
                warn!(bd_task_id = %bd_id, error = %e, "tracker sync failed");
            }
        }

        let mut event = Event::new(
            "loop.node.updated",
            self.session_id.clone(),
            json!({
                "type": "exec",
                "agentId": self.agent_id,
                "action": self.inner.name(),
                "status": if result.success { "done" } else { "failed" },
            }),
        )
        .with_agent(self.agent_id.clone());
        if let Some(workflow) = &self.workflow_id {
            event = event.with_workflow(workflow.clone());
        }
        if let Some(task) = &ctx.task_id {
            event = event.with_task(task.clone());
        }
        self.bus.emit(event);

        result
    }
}

/// Runs dispatched tasks through a ReAct loop with tracked actions
pub struct ExecutorLoop {
    agent: Arc<dyn Agent>,
    tracker: Arc<dyn Tracker>,
    bus: Arc<EventBus>,
    config: ExecutorConfig,
    snapshots: Option<Arc<dyn SnapshotSink>>,
    workdir: PathBuf,
}

impl ExecutorLoop {
    pub fn new(
        agent: Arc<dyn Agent>,
        tracker: Arc<dyn Tracker>,
        bus: Arc<EventBus>,
        config: ExecutorConfig,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent,
            tracker,
            bus,
            config,
            snapshots: None,
            workdir: workdir.into(),
        }
    }

    pub fn with_snapshots(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    /// Build the task-scoped registry: every builtin wrapped with
    /// tracker sync and progress events.
    fn wrapped_registry(
        &self,
        session_id: &str,
        workflow_id: Option<&str>,
        bd_task_id: Option<&str>,
    ) -> ActionRegistry {
        let base = standard_registry();
        let mut wrapped = ActionRegistry::new();
        for name in base.names() {
            if let Some(inner) = base.get(&name) {
                // Wrapping preserves name uniqueness from the base registry.
                let _ = wrapped.register(Arc::new(TrackedAction {
                    inner,
                    tracker: self.tracker.clone(),
                    bus: self.bus.clone(),
                    bd_task_id: bd_task_id.map(String::from),
                    agent_id: self.agent.id().to_string(),
                    session_id: session_id.to_string(),
                    workflow_id: workflow_id.map(String::from),
                }));
            }
        }
        wrapped
    }

    /// Execute one task to completion or failure.
    ///
    /// Emits `task_started` up front and `task_completed`/`task_failed`
    /// with the verdict; kernel transport failures (including user
    /// interruption) become failed outcomes rather than panics.
    pub async fn execute_task(
        &self,
        session_id: &str,
        workflow_id: Option<&str>,
        task_id: &str,
        description: &str,
        bd_task_id: Option<&str>,
    ) -> TaskOutcome {
        info!(%task_id, agent_id = %self.agent.id(), "executor starting task");
        self.emit_task_event("task_started", session_id, workflow_id, task_id, json!({}));

        let registry = Arc::new(self.wrapped_registry(session_id, workflow_id, bd_task_id));
        let config = ReactConfig {
            stop: StopConditions {
                max_rounds: self.config.max_iterations,
                ..Default::default()
            },
            fresh_session_per_round: self.config.fresh_session_per_round,
            ..Default::default()
        };

        let mut react = ReactLoop::new(self.agent.clone(), registry, config);
        if let Some(sink) = &self.snapshots {
            react = react.with_snapshots(sink.clone());
        }

        let ctx = ActionContext::new(session_id, &self.workdir)
            .with_task(task_id)
            .with_agent(self.agent.id());

        let outcome = match react.run(description, &ctx).await {
            Ok(outcome) => {
                let success = outcome.status == ReactStatus::Complete;
                TaskOutcome {
                    success,
                    observation: outcome.last_observation.clone().unwrap_or_default(),
                    rounds: outcome.rounds,
                    error: if success {
                        None
                    } else {
                        Some(
                            outcome
                                .last_error
                                .clone()
                                .unwrap_or_else(|| format!("loop stopped: {:?}", outcome.status)),
                        )
                    },
                }
            }
            Err(e) => {
                debug!(%task_id, error = %e, "executor agent transport failure");
                TaskOutcome {
                    success: false,
                    observation: String::new(),
                    rounds: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        if outcome.success {
            self.emit_task_event(
                "task_completed",
                session_id,
                workflow_id,
                task_id,
                json!({"observation": outcome.observation}),
            );
        } else {
            self.emit_task_event(
                "task_failed",
                session_id,
                workflow_id,
                task_id,
                json!({"error": outcome.error}),
            );
        }
        outcome
    }

    fn emit_task_event(&self, event_type: &str, session_id: &str, workflow_id: Option<&str>, task_id: &str, payload: Value) {
        let mut event = Event::new(event_type, session_id, payload)
            .with_task(task_id)
            .with_agent(self.agent.id());
        if let Some(workflow) = workflow_id {
            event = event.with_workflow(workflow);
        }
        self.bus.emit(event);
    }
}

/// Production [`TaskDispatcher`]: one kernel-backed executor agent per
/// dispatched task, fresh session keyed by task identity.
pub struct KernelTaskDispatcher {
    tracker: Arc<dyn Tracker>,
    bus: Arc<EventBus>,
    bridge: Arc<crate::kernel::KernelBridge>,
    binary: PathBuf,
    provider: String,
    workdir: PathBuf,
    config: ExecutorConfig,
}

impl KernelTaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<dyn Tracker>,
        bus: Arc<EventBus>,
        bridge: Arc<crate::kernel::KernelBridge>,
        binary: impl Into<PathBuf>,
        provider: impl Into<String>,
        workdir: impl Into<PathBuf>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            tracker,
            bus,
            bridge,
            binary: binary.into(),
            provider: provider.into(),
            workdir: workdir.into(),
            config,
        }
    }
}

#[async_trait]
impl crate::orchestrator::TaskDispatcher for KernelTaskDispatcher {
    async fn dispatch(
        &self,
        session_id: &str,
        workflow_id: &str,
        task: &crate::orchestrator::TaskNode,
    ) -> crate::orchestrator::DispatchOutcome {
        let agent_id = task
            .assignee
            .clone()
            .unwrap_or_else(|| format!("executor-{}", task.id));
        let kernel_session = format!("{}::{}", session_id, task.id);
        let agent = Arc::new(crate::react::KernelAgent::new(
            &agent_id,
            kernel_session,
            &self.provider,
            &self.binary,
            self.bridge.clone(),
        ));

        let executor = ExecutorLoop::new(
            agent,
            self.tracker.clone(),
            self.bus.clone(),
            self.config.clone(),
            &self.workdir,
        );
        let outcome = executor
            .execute_task(
                session_id,
                Some(workflow_id),
                &task.id,
                &task.description,
                task.tracker_id.as_deref(),
            )
            .await;

        crate::orchestrator::DispatchOutcome {
            success: outcome.success,
            observation: outcome.observation,
            error: outcome.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::testing::ScriptedAgent;
    use crate::tracker::{MemoryTracker, TrackerTaskStatus};
    use tempfile::tempdir;

    struct Fixture {
        executor: ExecutorLoop,
        tracker: Arc<MemoryTracker>,
        bus: Arc<EventBus>,
        _temp: tempfile::TempDir,
    }

    fn fixture(responses: Vec<&str>) -> Fixture {
        let temp = tempdir().unwrap();
        let tracker = Arc::new(MemoryTracker::new());
        let bus = EventBus::with_default_capacity();
        let agent = Arc::new(ScriptedAgent::new("exec-agent-1", responses));
        let executor = ExecutorLoop::new(
            agent,
            tracker.clone(),
            bus.clone(),
            ExecutorConfig {
                max_iterations: 5,
                fresh_session_per_round: false,
            },
            temp.path(),
        );
        Fixture {
            executor,
            tracker,
            bus,
            _temp: temp,
        }
    }

    async fn bd_task(tracker: &MemoryTracker) -> String {
        let epic = tracker.create_epic("e", "").await.unwrap();
        tracker.create_task(&epic, "t", "").await.unwrap()
    }

    #[tokio::test]
    async fn test_successful_task_closes_bd_and_emits_events() {
        let f = fixture(vec![
            r#"{"thought": "write the file", "action": "WRITE_FILE", "params": {"path": "x.txt", "content": "hi"}}"#,
            r#"{"action": "COMPLETE", "params": {"summary": "file x.txt created"}}"#,
        ]);
        let bd_id = bd_task(&f.tracker).await;

        let outcome = f
            .executor
            .execute_task("sess-1", Some("wf-1"), "task-1", "create file x.txt", Some(&bd_id))
            .await;

        assert!(outcome.success);
        assert!(outcome.observation.contains("file x.txt created"));
        assert_eq!(
            f.tracker.task_status(&bd_id).await.unwrap(),
            Some(TrackerTaskStatus::Closed)
        );
        // Intermediate action posted a comment before the close.
        assert!(f.tracker.comments(&bd_id).iter().any(|c| c.contains("WRITE_FILE")));

        let types: Vec<String> = f.bus.get_history(None).into_iter().map(|e| e.event_type).collect();
        assert!(types.contains(&"task_started".to_string()));
        assert!(types.contains(&"task_completed".to_string()));
        assert!(types.contains(&"loop.node.updated".to_string()));
    }

    #[tokio::test]
    async fn test_failed_task_blocks_bd() {
        let f = fixture(vec![r#"{"action": "FAIL", "params": {"reason": "cannot comply"}}"#]);
        let bd_id = bd_task(&f.tracker).await;

        let outcome = f
            .executor
            .execute_task("sess-1", None, "task-1", "do something", Some(&bd_id))
            .await;

        assert!(!outcome.success);
        assert_eq!(
            f.tracker.task_status(&bd_id).await.unwrap(),
            Some(TrackerTaskStatus::Blocked)
        );

        let types: Vec<String> = f.bus.get_history(None).into_iter().map(|e| e.event_type).collect();
        assert!(types.contains(&"task_failed".to_string()));
    }

    #[tokio::test]
    async fn test_agent_transport_failure_fails_task() {
        // No scripted responses: the agent errors on the first round.
        let f = fixture(vec![]);

        let outcome = f
            .executor
            .execute_task("sess-1", None, "task-1", "do something", None)
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        let failed: Vec<Event> = f.bus.get_history_by_type("task_failed", None);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].agent_id.as_deref(), Some("exec-agent-1"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_failure() {
        let f = fixture(vec![
            r#"{"action": "LIST_DIR", "params": {}}"#,
            r#"{"action": "LIST_DIR", "params": {"path": "a"}}"#,
            r#"{"action": "LIST_DIR", "params": {}}"#,
            r#"{"action": "LIST_DIR", "params": {"path": "b"}}"#,
            r#"{"action": "LIST_DIR", "params": {}}"#,
        ]);

        let outcome = f
            .executor
            .execute_task("sess-1", None, "task-1", "wander aimlessly", None)
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Budget"));
    }

    #[tokio::test]
    async fn test_wrapper_preserves_verdict() {
        // The same scripted decisions through the bare registry and the
        // wrapped one produce the same success verdicts.
        let temp = tempdir().unwrap();
        let decisions = r#"{"action": "WRITE_FILE", "params": {"path": "y.txt", "content": "z"}}"#;

        let bare = standard_registry();
        let ctx = ActionContext::new("sess-1", temp.path());
        let bare_result = bare
            .execute("WRITE_FILE", serde_json::json!({"path": "y.txt", "content": "z"}), &ctx)
            .await;

        let f = fixture(vec![decisions, r#"{"action": "COMPLETE"}"#]);
        let bd_id = bd_task(&f.tracker).await;
        let registry = f.executor.wrapped_registry("sess-1", None, Some(&bd_id));
        let wrapped_result = registry
            .execute("WRITE_FILE", serde_json::json!({"path": "y.txt", "content": "z"}), &ctx)
            .await;

        assert_eq!(bare_result.success, wrapped_result.success);
    }
}
