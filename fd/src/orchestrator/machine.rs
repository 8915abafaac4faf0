//! Orchestrator phase machine
//!
//! Drives one user task (an epic) through the fixed phase sequence.
//! Every phase is a named action the planning agent may emit; each
//! transition validates its predecessors, mutates state, writes a
//! checkpoint, and emits `epic.phase_transition`/`phase_transition`
//! events. The containing ReAct loop supplies convergence and stuck
//! budgets; escalating results force the machine into `replanning`.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sessionstore::{Checkpoint, CheckpointStore, TaskProgress};

use crate::actions::{ActionContext, ActionRegistry, ActionResult, FnAction};
use crate::events::{Event, EventBus};
use crate::pool::{CapabilityRule, ReleaseReason, Requirement, ResourcePool, infer_requirements};
use crate::react::{Agent, ReactConfig, ReactLoop, ReactOutcome, ReactStatus, StopConditions};
use crate::tracker::Tracker;

use super::graph::{TaskGraph, TaskNode, TaskStatus};
use super::phase::Phase;

/// Dispatches one ready task to a worker agent and awaits its verdict
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, session_id: &str, workflow_id: &str, task: &TaskNode) -> DispatchOutcome;
}

/// Executor-side verdict as the orchestrator consumes it
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub observation: String,
    pub error: Option<String>,
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub capability_rules: Vec<CapabilityRule>,
    /// VERIFY passes at or above this completion rate
    pub verify_threshold: f64,
    /// Checkpoints retained per session
    pub checkpoint_keep: usize,
    /// Round budget for the planning loop
    pub max_rounds: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capability_rules: crate::pool::default_rules(),
            verify_threshold: 0.8,
            checkpoint_keep: 20,
            max_rounds: 30,
        }
    }
}

/// Design artifacts accumulated across phases
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub high_design: Option<String>,
    pub detail_design: Option<String>,
    pub deliverables: Vec<String>,
}

/// Mutable orchestrator state, owned behind one lock
pub struct OrchestratorState {
    pub phase: Phase,
    pub phase_history: Vec<String>,
    pub graph: TaskGraph,
    pub artifacts: Artifacts,
    pub last_error: Option<String>,
    pub failure_checks: u32,
    pub round: u32,
}

impl OrchestratorState {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            phase_history: vec![phase.as_str().to_string()],
            graph: TaskGraph::new(),
            artifacts: Artifacts::default(),
            last_error: None,
            failure_checks: 0,
            round: 0,
        }
    }
}

/// Everything the phase-action handlers share
pub struct OrchestratorCore {
    pub session_id: String,
    /// Workflow identity (doubles as the epic id on the bus)
    pub workflow_id: String,
    pub user_task: String,
    /// Tracker-side epic identity
    pub tracker_epic: Mutex<Option<String>>,
    pub state: Mutex<OrchestratorState>,
    pool: Arc<Mutex<ResourcePool>>,
    tracker: Arc<dyn Tracker>,
    bus: Arc<EventBus>,
    checkpoints: Arc<CheckpointStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: OrchestratorConfig,
}

impl OrchestratorCore {
    // === Checkpointing and transitions ===

    /// Write a checkpoint of the current state with `reason`
    async fn write_checkpoint(&self, state: &OrchestratorState, reason: &str) -> Option<String> {
        let mut checkpoint = Checkpoint::new(&self.session_id, &self.user_task, state.phase.as_str());
        checkpoint.reason = Some(reason.to_string());
        checkpoint.phase_history = state.phase_history.clone();
        checkpoint.task_progress = state
            .graph
            .tasks()
            .iter()
            .map(|t| TaskProgress {
                task_id: t.id.clone(),
                description: t.description.clone(),
                status: t.status.as_str().to_string(),
                dependencies: t.dependencies.clone(),
                started_at: None,
                completed_at: None,
                iterations: t.iterations,
                error: t.last_result.as_ref().and_then(|r| r.error.clone()),
            })
            .collect();
        checkpoint.context = json!({
            "highDesign": state.artifacts.high_design,
            "detailDesign": state.artifacts.detail_design,
            "deliverables": state.artifacts.deliverables,
            "lastError": state.last_error,
            "failureChecks": state.failure_checks,
        });

        match self.checkpoints.append(checkpoint) {
            Ok(saved) => {
                let _ = self.checkpoints.cleanup_old(&self.session_id, self.config.checkpoint_keep);
                Some(saved.id)
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "checkpoint write failed");
                None
            }
        }
    }

    /// Transition to `to`, checkpoint, and emit the transition events
    async fn transition(&self, state: &mut OrchestratorState, to: Phase, trigger: &str) {
        let from = state.phase;
        if from == to {
            return;
        }
        info!(session_id = %self.session_id, from = %from, to = %to, trigger, "phase transition");
        state.phase = to;
        state.phase_history.push(to.as_str().to_string());

        let checkpoint_id = self.write_checkpoint(state, trigger).await;
        let payload = json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "triggerAction": trigger,
            "checkpointId": checkpoint_id,
            "round": state.round,
        });
        self.bus.emit(
            Event::new("epic.phase_transition", self.session_id.clone(), payload.clone())
                .with_workflow(self.workflow_id.clone()),
        );
        self.bus.emit(
            Event::new("phase_transition", self.session_id.clone(), payload)
                .with_workflow(self.workflow_id.clone()),
        );
    }

    async fn tracker_epic_id(&self) -> Option<String> {
        self.tracker_epic.lock().await.clone()
    }

    /// Lazily create the tracker epic
    async fn ensure_tracker_epic(&self) -> Option<String> {
        let mut epic = self.tracker_epic.lock().await;
        if epic.is_none() {
            match self.tracker.create_epic(&self.user_task, &self.user_task).await {
                Ok(id) => {
                    self.bus.emit(
                        Event::new("epic.created", self.session_id.clone(), json!({"trackerEpic": id.clone()}))
                            .with_workflow(self.workflow_id.clone()),
                    );
                    *epic = Some(id);
                }
                Err(e) => warn!(error = %e, "tracker epic creation failed"),
            }
        }
        epic.clone()
    }

    // === Phase handlers ===

    /// HIGH_DESIGN / DETAIL_DESIGN / DELIVERABLES: record the artifact,
    /// comment the tracker, transition.
    async fn handle_artifact(&self, which: Phase, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;

        let observation = match which {
            Phase::HighDesign => {
                let content = params["content"].as_str().unwrap_or_default().to_string();
                if content.trim().is_empty() {
                    return ActionResult::error("HIGH_DESIGN requires non-empty content");
                }
                state.artifacts.high_design = Some(content);
                "high-level design recorded".to_string()
            }
            Phase::DetailDesign => {
                let content = params["content"].as_str().unwrap_or_default().to_string();
                if content.trim().is_empty() {
                    return ActionResult::error("DETAIL_DESIGN requires non-empty content");
                }
                state.artifacts.detail_design = Some(content);
                "detailed design recorded".to_string()
            }
            Phase::Deliverables => {
                let artifacts: Vec<String> = params["artifacts"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                state.artifacts.deliverables = artifacts;
                format!("{} deliverable(s) declared", state.artifacts.deliverables.len())
            }
            _ => return ActionResult::error("internal: unsupported artifact phase"),
        };

        if let Some(epic) = self.ensure_tracker_epic().await
            && let Err(e) = self.tracker.comment_epic(&epic, &observation).await
        {
            warn!(error = %e, "tracker comment failed");
        }

        self.transition(&mut state, which, which.as_str()).await;
        ActionResult::ok(observation)
    }

    /// PLAN: replace the task graph and register tasks with the tracker
    async fn handle_plan(&self, params: Value) -> ActionResult {
        let Some(raw_tasks) = params["tasks"].as_array() else {
            return ActionResult::error("PLAN requires a tasks array");
        };
        if raw_tasks.is_empty() {
            return ActionResult::error("PLAN requires at least one task");
        }

        let mut tasks = Vec::new();
        for (index, raw) in raw_tasks.iter().enumerate() {
            let id = raw["id"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("task-{}", index + 1));
            let Some(description) = raw["description"].as_str() else {
                return ActionResult::error(format!("task {} is missing a description", id));
            };
            let dependencies: Vec<String> = raw["dependencies"]
                .as_array()
                .map(|deps| deps.iter().filter_map(|d| d.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let mut node = TaskNode::new(id, description, dependencies);
            if let Some(assignee) = raw["assignee"].as_str() {
                node.assignee = Some(assignee.to_string());
            }
            tasks.push(node);
        }

        let epic = self.ensure_tracker_epic().await;
        for task in &mut tasks {
            if let Some(epic_id) = &epic {
                match self.tracker.create_task(epic_id, &task.description, &task.description).await {
                    Ok(tracker_id) => task.tracker_id = Some(tracker_id),
                    Err(e) => warn!(task_id = %task.id, error = %e, "tracker task creation failed"),
                }
            }
        }

        let mut state = self.state.lock().await;
        state.round += 1;
        let count = tasks.len();
        state.graph.replace(tasks);
        self.transition(&mut state, Phase::Plan, "PLAN").await;

        debug!(count, "plan recorded");
        ActionResult::ok_with_data(
            format!("planned {} task(s)", count),
            json!({"taskIds": state.graph.tasks().iter().map(|t| t.id.clone()).collect::<Vec<_>>()}),
        )
    }

    /// PARALLEL_DISPATCH: allocate resources for the candidate set and
    /// run the dispatches concurrently, joining before the phase
    /// transition completes.
    async fn handle_parallel_dispatch(&self, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;

        if state.graph.is_empty() {
            return ActionResult::error("PARALLEL_DISPATCH requires a plan");
        }
        state.graph.refresh_readiness();

        let candidates: Vec<String> = params["task_ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .filter(|ids: &Vec<String>| !ids.is_empty())
            .unwrap_or_else(|| state.graph.ready_ids());

        let ready: Vec<TaskNode> = candidates
            .iter()
            .filter_map(|id| state.graph.get(id).cloned())
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        if ready.is_empty() {
            return ActionResult::error("no ready tasks to dispatch");
        }

        self.transition(&mut state, Phase::ParallelDispatch, "PARALLEL_DISPATCH").await;

        // Phase 1: allocate for every task, all-or-nothing across the
        // candidate set.
        let mut allocated: Vec<(TaskNode, Vec<String>)> = Vec::new();
        let mut shortage: Option<(String, Value)> = None;
        {
            let mut pool = self.pool.lock().await;
            for task in &ready {
                let requirements: Vec<Requirement> =
                    infer_requirements(&task.description, &self.config.capability_rules);
                let result = pool.allocate_resources(&task.id, &requirements);
                if result.success {
                    let resources = result.allocated_resources.unwrap_or_default();
                    self.bus.emit(
                        Event::new(
                            "resource.allocated",
                            self.session_id.clone(),
                            json!({"taskId": task.id.clone(), "resources": resources.clone()}),
                        )
                        .with_task(task.id.clone()),
                    );
                    allocated.push((task.clone(), resources));
                } else {
                    shortage = Some((
                        task.id.clone(),
                        serde_json::to_value(&result.missing_resources).unwrap_or(Value::Null),
                    ));
                    break;
                }
            }

            if let Some((short_task, missing)) = shortage {
                // Roll the allocations made in this call back.
                for (task, _) in &allocated {
                    let _ = pool.release_resources(&task.id, ReleaseReason::Released);
                }
                drop(pool);

                warn!(task_id = %short_task, "resource shortage during dispatch");
                self.bus.emit(
                    Event::new(
                        "resource_shortage",
                        self.session_id.clone(),
                        json!({"taskId": short_task.clone(), "missing": missing.clone()}),
                    )
                    .with_workflow(self.workflow_id.clone()),
                );
                self.transition(&mut state, Phase::BlockedReview, "resource_shortage").await;
                return ActionResult {
                    success: false,
                    observation: None,
                    error: Some(format!("resource_shortage: cannot staff task {}", short_task)),
                    data: Some(json!({"reason": "resource_shortage", "taskId": short_task.clone(), "missing": missing})),
                    should_stop: false,
                    stop_reason: None,
                };
            }

            for (task, _) in &allocated {
                let _ = pool.mark_task_executing(&task.id);
            }
        }

        // Mark in-progress before releasing the state lock for dispatch.
        for (task, resources) in &allocated {
            if let Some(node) = state.graph.get_mut(&task.id) {
                node.status = TaskStatus::InProgress;
                node.assignee = resources.first().cloned();
                node.iterations += 1;
            }
        }
        let total = state.graph.len();
        drop(state);

        // Phase 2: dispatch concurrently and join.
        let dispatches = allocated.iter().map(|(task, resources)| {
            let mut task = task.clone();
            task.assignee = resources.first().cloned();
            async move {
                let outcome = self.dispatcher.dispatch(&self.session_id, &self.workflow_id, &task).await;
                (task.id.clone(), outcome)
            }
        });
        let outcomes = futures::future::join_all(dispatches).await;

        // Phase 3: record verdicts and release resources.
        let mut state = self.state.lock().await;
        let mut completed = 0usize;
        let mut failed = 0usize;
        for (task_id, outcome) in &outcomes {
            let release_reason = if outcome.success {
                completed += 1;
                ReleaseReason::Completed
            } else {
                failed += 1;
                ReleaseReason::Error(outcome.error.clone().unwrap_or_else(|| "task failed".to_string()))
            };
            {
                let mut pool = self.pool.lock().await;
                if let Ok(released) = pool.release_resources(task_id, release_reason) {
                    self.bus.emit(
                        Event::new(
                            "resource.released",
                            self.session_id.clone(),
                            json!({"taskId": task_id.clone(), "resources": released.clone()}),
                        )
                        .with_task(task_id.clone()),
                    );
                }
            }
            if let Some(node) = state.graph.get_mut(task_id) {
                node.status = if outcome.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                node.last_result = Some(super::graph::TaskResult {
                    success: outcome.success,
                    output: outcome.observation.clone(),
                    error: outcome.error.clone(),
                });
            }
            if !outcome.success {
                state.last_error = outcome.error.clone();
            }
        }
        state.graph.refresh_readiness();

        let progress = (state.graph.completed_count() as f64 / total.max(1) as f64 * 100.0).round();
        self.bus.emit(
            Event::new(
                "workflow_progress",
                self.session_id.clone(),
                json!({"percent": progress, "completed": state.graph.completed_count(), "total": total}),
            )
            .with_workflow(self.workflow_id.clone()),
        );

        let _ = self.write_checkpoint(&state, "parallel_dispatch").await;
        info!(completed, failed, "dispatch round finished");
        ActionResult::ok_with_data(
            format!("dispatched {} task(s): {} completed, {} failed", outcomes.len(), completed, failed),
            json!({"completed": completed, "failed": failed, "dispatched": outcomes.len()}),
        )
    }

    /// BLOCKED_REVIEW: single-dispatch each unblocked task to the
    /// strongest matching resource; undispatchable tasks stay blocked.
    async fn handle_blocked_review(&self, _params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;
        self.transition(&mut state, Phase::BlockedReview, "BLOCKED_REVIEW").await;
        state.graph.refresh_readiness();

        // Tasks whose dependencies are now satisfied were promoted to
        // ready by the refresh; walk them one at a time.
        let review_set: Vec<TaskNode> = state
            .graph
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .cloned()
            .collect();

        let mut dispatched = 0usize;
        let mut still_blocked = 0usize;
        for task in review_set {
            let requirements = infer_requirements(&task.description, &self.config.capability_rules);

            // Single dispatch prefers the strongest matching resource.
            let allocation = {
                let mut pool = self.pool.lock().await;
                let strongest = requirements
                    .first()
                    .and_then(|req| req.capabilities.first().cloned())
                    .and_then(|cap| {
                        pool.get_resources_by_capability(&cap, 1)
                            .into_iter()
                            .filter(|r| r.status == crate::pool::ResourceStatus::Available)
                            .max_by_key(|r| r.capability_level(&cap).unwrap_or(0))
                            .map(|r| r.id.clone())
                    });
                debug!(task_id = %task.id, ?strongest, "blocked review single dispatch");
                match strongest {
                    Some(resource_id) => pool.allocate_named(&task.id, &resource_id),
                    None => pool.allocate_resources(&task.id, &requirements),
                }
            };

            if !allocation.success {
                still_blocked += 1;
                continue;
            }

            {
                let mut pool = self.pool.lock().await;
                let _ = pool.mark_task_executing(&task.id);
            }
            if let Some(node) = state.graph.get_mut(&task.id) {
                node.status = TaskStatus::InProgress;
                node.iterations += 1;
            }

            let outcome = self.dispatcher.dispatch(&self.session_id, &self.workflow_id, &task).await;
            {
                let mut pool = self.pool.lock().await;
                let reason = if outcome.success {
                    ReleaseReason::Completed
                } else {
                    ReleaseReason::Error(outcome.error.clone().unwrap_or_default())
                };
                let _ = pool.release_resources(&task.id, reason);
            }
            if let Some(node) = state.graph.get_mut(&task.id) {
                node.status = if outcome.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                node.last_result = Some(super::graph::TaskResult {
                    success: outcome.success,
                    output: outcome.observation.clone(),
                    error: outcome.error.clone(),
                });
            }
            state.graph.refresh_readiness();
            dispatched += 1;
        }

        let _ = self.write_checkpoint(&state, "blocked_review").await;
        ActionResult::ok(format!(
            "blocked review: {} dispatched, {} still blocked",
            dispatched,
            still_blocked + state.graph.blocked_ids().len()
        ))
    }

    /// VERIFY: completion rate plus the artifact check (vacuous when no
    /// deliverables are declared).
    async fn handle_verify(&self, _params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;

        if state.graph.is_empty() {
            return ActionResult::error("VERIFY requires a task graph");
        }

        let rate = state.graph.completion_rate();
        let mut missing_artifacts: Vec<String> = Vec::new();
        for artifact in &state.artifacts.deliverables {
            let needle = artifact.to_lowercase();
            let covered = state
                .graph
                .tasks()
                .iter()
                .any(|t| t.status == TaskStatus::Completed && t.description.to_lowercase().contains(&needle));
            if !covered {
                missing_artifacts.push(artifact.clone());
            }
        }

        let rate_ok = rate >= self.config.verify_threshold;
        if rate_ok && missing_artifacts.is_empty() {
            if let Some(epic) = self.tracker_epic_id().await
                && let Err(e) = self.tracker.close_epic(&epic).await
            {
                warn!(error = %e, "tracker epic close failed");
            }
            self.transition(&mut state, Phase::Completed, "VERIFY").await;
            self.bus.emit(
                Event::new(
                    "epic.completed",
                    self.session_id.clone(),
                    json!({"success": true, "completionRate": rate}),
                )
                .with_workflow(self.workflow_id.clone()),
            );
            return ActionResult {
                success: true,
                observation: Some(format!("verified: completion rate {:.0}%", rate * 100.0)),
                error: None,
                data: Some(json!({"completionRate": rate})),
                should_stop: true,
                stop_reason: Some(crate::actions::StopReason::Complete),
            };
        }

        // Fail without stopping so the loop may FAIL or replan.
        ActionResult {
            success: false,
            observation: None,
            error: Some(format!(
                "verification failed: completion rate {:.0}%, missing artifacts {:?}",
                rate * 100.0,
                missing_artifacts
            )),
            data: Some(json!({"completionRate": rate, "missingArtifacts": missing_artifacts})),
            should_stop: false,
            stop_reason: None,
        }
    }

    /// COMPLETE: only valid once every task is terminal
    async fn handle_complete(&self, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;

        if !state.graph.all_terminal() {
            return ActionResult::error("COMPLETE requires every task in a terminal state");
        }
        self.transition(&mut state, Phase::Completed, "COMPLETE").await;
        self.bus.emit(
            Event::new("epic.completed", self.session_id.clone(), json!({"success": true}))
                .with_workflow(self.workflow_id.clone()),
        );
        ActionResult::complete(params["summary"].as_str().unwrap_or("epic complete").to_string())
    }

    /// FAIL: terminal failure of the epic
    async fn handle_fail(&self, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;
        let reason = params["reason"].as_str().unwrap_or("unspecified failure").to_string();
        state.last_error = Some(reason.clone());
        self.transition(&mut state, Phase::Failed, "FAIL").await;
        self.bus.emit(
            Event::new(
                "epic.completed",
                self.session_id.clone(),
                json!({"success": false, "error": reason}),
            )
            .with_workflow(self.workflow_id.clone()),
        );
        ActionResult::fail(reason)
    }

    /// STOP: pause dispatch; a resource-flavored reason goes to
    /// blocked_review instead of paused.
    async fn handle_stop(&self, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;
        let reason = params["reason"].as_str().unwrap_or("").to_string();
        let target = if reason.to_lowercase().contains("resource") {
            Phase::BlockedReview
        } else {
            Phase::Paused
        };
        self.transition(&mut state, target, "STOP").await;
        ActionResult::ok(format!("stopped into {}", target))
    }

    /// START: resume from paused/blocked_review; from blocked_review the
    /// ready tasks' requirements must all be satisfiable again.
    async fn handle_start(&self, _params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;

        match state.phase {
            Phase::Paused => {}
            Phase::BlockedReview => {
                state.graph.refresh_readiness();
                let pool = self.pool.lock().await;
                for id in state.graph.ready_ids() {
                    let Some(task) = state.graph.get(&id) else { continue };
                    let requirements = infer_requirements(&task.description, &self.config.capability_rules);
                    let check = pool.check_resource_requirements(&requirements);
                    if !check.satisfied {
                        return ActionResult::error(format!(
                            "START refused: task {} still lacks resources",
                            id
                        ));
                    }
                }
            }
            other => {
                return ActionResult::error(format!("START refused from phase {}", other));
            }
        }

        self.transition(&mut state, Phase::Plan, "START").await;
        ActionResult::ok("dispatch resumed")
    }

    /// QUERY_CAPABILITIES: non-mutating catalog + status report
    async fn handle_query_capabilities(&self, _params: Value) -> ActionResult {
        let pool = self.pool.lock().await;
        let catalog = pool.get_capability_catalog();
        let report = pool.get_status_report();

        let catalog_json: Value = catalog
            .iter()
            .map(|(cap, holders)| {
                (
                    cap.clone(),
                    json!(
                        holders
                            .iter()
                            .map(|(id, rtype, level)| json!({"resourceId": id, "type": rtype, "level": level}))
                            .collect::<Vec<_>>()
                    ),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();

        ActionResult::ok_with_data(
            format!(
                "{} capabilities across {} resources ({} available)",
                catalog.len(),
                report.total,
                report.available
            ),
            json!({"catalog": catalog_json, "status": report}),
        )
    }

    /// CHECKPOINT: framework-invoked snapshot. A repeating-failure
    /// history escalates to replanning.
    async fn handle_checkpoint(&self, params: Value) -> ActionResult {
        let mut state = self.state.lock().await;
        state.round += 1;
        let trigger = params["trigger"].as_str().unwrap_or("reentry").to_string();

        if trigger == "task_failure" {
            state.failure_checks += 1;
            let repeating = state.failure_checks > 1
                && state.last_error.as_deref().is_some_and(|e| !e.is_empty())
                && !state.graph.failed_ids().is_empty();
            if repeating {
                warn!(session_id = %self.session_id, checks = state.failure_checks, "repeating failure, escalating");
                self.transition(&mut state, Phase::Replanning, "task_failure").await;
                return ActionResult::escalate("repeating task failures; replanning");
            }
        }

        let checkpoint_id = self.write_checkpoint(&state, &trigger).await;
        ActionResult::ok_with_data(
            format!("checkpoint written ({})", trigger),
            json!({"checkpointId": checkpoint_id}),
        )
    }
}

/// The orchestrator: a phase machine plus the planning loop that drives it
pub struct Orchestrator {
    core: Arc<OrchestratorCore>,
}

impl Orchestrator {
    /// Create a fresh orchestrator for a new epic (phase `understanding`)
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_task: impl Into<String>,
        pool: Arc<Mutex<ResourcePool>>,
        tracker: Arc<dyn Tracker>,
        bus: Arc<EventBus>,
        checkpoints: Arc<CheckpointStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_phase(
            session_id, workflow_id, user_task, pool, tracker, bus, checkpoints, dispatcher, config,
            Phase::Understanding,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_phase(
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_task: impl Into<String>,
        pool: Arc<Mutex<ResourcePool>>,
        tracker: Arc<dyn Tracker>,
        bus: Arc<EventBus>,
        checkpoints: Arc<CheckpointStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: OrchestratorConfig,
        phase: Phase,
    ) -> Self {
        Self {
            core: Arc::new(OrchestratorCore {
                session_id: session_id.into(),
                workflow_id: workflow_id.into(),
                user_task: user_task.into(),
                tracker_epic: Mutex::new(None),
                state: Mutex::new(OrchestratorState::new(phase)),
                pool,
                tracker,
                bus,
                checkpoints,
                dispatcher,
                config,
            }),
        }
    }

    /// Resume from the latest checkpoint: restore the task graph, design
    /// artifacts, error history, and phase. With no checkpoint the
    /// machine starts in `replanning`.
    #[allow(clippy::too_many_arguments)]
    pub async fn resume(
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
        pool: Arc<Mutex<ResourcePool>>,
        tracker: Arc<dyn Tracker>,
        bus: Arc<EventBus>,
        checkpoints: Arc<CheckpointStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        let session_id = session_id.into();
        let latest = checkpoints.find_latest(&session_id).ok().flatten();

        let (phase, user_task) = match &latest {
            Some(cp) => (Phase::resume_from(&cp.phase), cp.user_task.clone()),
            None => (Phase::Replanning, String::new()),
        };
        info!(%session_id, phase = %phase, has_checkpoint = latest.is_some(), "orchestrator resuming");

        let orchestrator = Self::with_phase(
            session_id, workflow_id, user_task, pool, tracker, bus, checkpoints, dispatcher, config, phase,
        );

        if let Some(cp) = latest {
            let mut state = orchestrator.core.state.lock().await;
            state.phase_history = cp.phase_history.clone();
            state.last_error = cp.context["lastError"].as_str().map(String::from);
            state.failure_checks = cp.context["failureChecks"].as_u64().unwrap_or(0) as u32;
            state.artifacts.high_design = cp.context["highDesign"].as_str().map(String::from);
            state.artifacts.detail_design = cp.context["detailDesign"].as_str().map(String::from);
            state.artifacts.deliverables = cp.context["deliverables"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();

            let tasks: Vec<TaskNode> = cp
                .task_progress
                .iter()
                .map(|p| {
                    let mut node = TaskNode::new(&p.task_id, &p.description, p.dependencies.clone());
                    node.status = TaskStatus::parse(&p.status).unwrap_or(TaskStatus::Pending);
                    node.iterations = p.iterations;
                    node
                })
                .collect();
            let mut graph = TaskGraph::new();
            graph.replace(tasks);
            // replace() promotes everything dependency-free to ready;
            // restore the recorded statuses on top.
            for progress in &cp.task_progress {
                if let Some(node) = graph.get_mut(&progress.task_id) {
                    node.status = TaskStatus::parse(&progress.status).unwrap_or(TaskStatus::Pending);
                }
            }
            graph.refresh_readiness();
            state.graph = graph;
        }
        orchestrator
    }

    pub fn core(&self) -> Arc<OrchestratorCore> {
        self.core.clone()
    }

    /// Current phase snapshot
    pub async fn phase(&self) -> Phase {
        self.core.state.lock().await.phase
    }

    /// Build the registry of phase actions bound to this machine
    pub fn build_registry(&self) -> ActionRegistry {
        let mut registry = ActionRegistry::new();

        let artifact_schema = json!({
            "type": "object",
            "properties": {"content": {"type": "string"}},
            "required": ["content"]
        });

        macro_rules! bind {
            ($name:expr, $desc:expr, $schema:expr, $method:ident) => {{
                let core = self.core.clone();
                let _ = registry.register(Arc::new(FnAction::new($name, $desc, $schema, move |params, _ctx| {
                    let core = core.clone();
                    Box::pin(async move { core.$method(params).await })
                })));
            }};
        }

        {
            let core = self.core.clone();
            let schema = artifact_schema.clone();
            let _ = registry.register(Arc::new(FnAction::new(
                "HIGH_DESIGN",
                "Record the high-level design for the user task.",
                schema,
                move |params, _ctx| {
                    let core = core.clone();
                    Box::pin(async move { core.handle_artifact(Phase::HighDesign, params).await })
                },
            )));
        }
        {
            let core = self.core.clone();
            let _ = registry.register(Arc::new(FnAction::new(
                "DETAIL_DESIGN",
                "Record the detailed design.",
                artifact_schema,
                move |params, _ctx| {
                    let core = core.clone();
                    Box::pin(async move { core.handle_artifact(Phase::DetailDesign, params).await })
                },
            )));
        }
        {
            let core = self.core.clone();
            let _ = registry.register(Arc::new(FnAction::new(
                "DELIVERABLES",
                "Declare the deliverable artifacts for verification.",
                json!({"type": "object", "properties": {"artifacts": {"type": "array", "items": {"type": "string"}}}}),
                move |params, _ctx| {
                    let core = core.clone();
                    Box::pin(async move { core.handle_artifact(Phase::Deliverables, params).await })
                },
            )));
        }

        bind!(
            "PLAN",
            "Replace the task graph with the proposed tasks.",
            json!({
                "type": "object",
                "properties": {"tasks": {"type": "array", "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "description": {"type": "string"},
                        "dependencies": {"type": "array", "items": {"type": "string"}},
                        "assignee": {"type": "string"}
                    },
                    "required": ["description"]
                }}},
                "required": ["tasks"]
            }),
            handle_plan
        );
        bind!(
            "PARALLEL_DISPATCH",
            "Allocate resources for the ready tasks and dispatch them concurrently.",
            json!({"type": "object", "properties": {"task_ids": {"type": "array", "items": {"type": "string"}}}}),
            handle_parallel_dispatch
        );
        bind!(
            "BLOCKED_REVIEW",
            "Attempt single dispatch of unblocked tasks.",
            json!({"type": "object"}),
            handle_blocked_review
        );
        bind!(
            "VERIFY",
            "Check completion rate and deliverable coverage.",
            json!({"type": "object"}),
            handle_verify
        );
        bind!(
            "COMPLETE",
            "Close the epic (requires every task terminal).",
            json!({"type": "object", "properties": {"summary": {"type": "string"}}}),
            handle_complete
        );
        bind!(
            "FAIL",
            "Abandon the epic with a reason.",
            json!({"type": "object", "properties": {"reason": {"type": "string"}}, "required": ["reason"]}),
            handle_fail
        );
        bind!(
            "STOP",
            "Pause dispatch (a resource-related reason enters blocked review).",
            json!({"type": "object", "properties": {"reason": {"type": "string"}}}),
            handle_stop
        );
        bind!(
            "START",
            "Resume dispatch from paused or blocked review.",
            json!({"type": "object"}),
            handle_start
        );
        bind!(
            "QUERY_CAPABILITIES",
            "Report the current capability catalog and pool status.",
            json!({"type": "object"}),
            handle_query_capabilities
        );
        bind!(
            "CHECKPOINT",
            "Write a checkpoint (reentry or task_failure trigger).",
            json!({"type": "object", "properties": {"trigger": {"type": "string"}}}),
            handle_checkpoint
        );

        registry
    }

    /// Drive the epic with a planning agent until the loop stops. An
    /// escalated outcome forces the machine into `replanning`.
    pub async fn run(&self, planner: Arc<dyn Agent>, workdir: &std::path::Path) -> eyre::Result<ReactOutcome> {
        let registry = Arc::new(self.build_registry());
        let config = ReactConfig {
            stop: StopConditions {
                complete_actions: vec!["COMPLETE".to_string(), "VERIFY".to_string()],
                fail_actions: vec!["FAIL".to_string()],
                max_rounds: self.core.config.max_rounds,
                on_convergence: true,
                on_stuck: Some(5),
                max_rejections: None,
            },
            ..Default::default()
        };

        let react = ReactLoop::new(planner, registry, config);
        let ctx = ActionContext::new(&self.core.session_id, workdir);
        let goal = format!("Orchestrate this user task to completion: {}", self.core.user_task);

        let outcome = react.run(&goal, &ctx).await?;

        if outcome.status == ReactStatus::Escalated {
            let mut state = self.core.state.lock().await;
            if state.phase != Phase::Replanning {
                self.core.transition(&mut state, Phase::Replanning, "escalate").await;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::default_executor;
    use crate::react::testing::ScriptedAgent;
    use crate::tracker::MemoryTracker;
    use serde_json::json;
    use tempfile::tempdir;

    /// Dispatcher that succeeds unless the task id is in the fail list
    struct ScriptedDispatcher {
        fail: Vec<String>,
    }

    impl ScriptedDispatcher {
        fn ok() -> Arc<Self> {
            Arc::new(Self { fail: Vec::new() })
        }

        fn failing(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail: ids.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl TaskDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, _session_id: &str, _workflow_id: &str, task: &TaskNode) -> DispatchOutcome {
            if self.fail.contains(&task.id) {
                DispatchOutcome {
                    success: false,
                    observation: String::new(),
                    error: Some(format!("scripted failure for {}", task.id)),
                }
            } else {
                DispatchOutcome {
                    success: true,
                    observation: format!("done: {}", task.description),
                    error: None,
                }
            }
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        bus: Arc<EventBus>,
        pool: Arc<Mutex<ResourcePool>>,
        tracker: Arc<MemoryTracker>,
        checkpoints: Arc<CheckpointStore>,
        _temp: tempfile::TempDir,
    }

    fn fixture_with(dispatcher: Arc<dyn TaskDispatcher>, executors: &[(&str, &[(&str, u8)])]) -> Fixture {
        let temp = tempdir().unwrap();
        let bus = EventBus::with_default_capacity();
        let tracker = Arc::new(MemoryTracker::new());
        let checkpoints = Arc::new(CheckpointStore::new(temp.path().join("checkpoints")));

        let mut pool = ResourcePool::in_memory();
        for (name, caps) in executors {
            pool.add_resource(default_executor(name, caps)).unwrap();
        }
        let pool = Arc::new(Mutex::new(pool));

        let orchestrator = Orchestrator::new(
            "sess-1",
            "wf-1",
            "build file X and file Y",
            pool.clone(),
            tracker.clone(),
            bus.clone(),
            checkpoints.clone(),
            dispatcher,
            OrchestratorConfig::default(),
        );
        Fixture {
            orchestrator,
            bus,
            pool,
            tracker,
            checkpoints,
            _temp: temp,
        }
    }

    fn two_file_tasks() -> Value {
        json!({"tasks": [
            {"id": "task-1", "description": "create file X"},
            {"id": "task-2", "description": "create file Y"}
        ]})
    }

    async fn exec(f: &Fixture, action: &str, params: Value) -> ActionResult {
        let registry = f.orchestrator.build_registry();
        let ctx = ActionContext::new("sess-1", "/tmp");
        registry.execute(action, params, &ctx).await
    }

    fn event_types(bus: &EventBus) -> Vec<String> {
        bus.get_history(None).into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_happy_path_plan_dispatch_verify() {
        let f = fixture_with(
            ScriptedDispatcher::ok(),
            &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])],
        );

        let plan = exec(&f, "PLAN", two_file_tasks()).await;
        assert!(plan.success, "{:?}", plan.error);
        assert_eq!(f.orchestrator.phase().await, Phase::Plan);

        let dispatch = exec(&f, "PARALLEL_DISPATCH", json!({})).await;
        assert!(dispatch.success, "{:?}", dispatch.error);
        assert_eq!(dispatch.data.as_ref().unwrap()["completed"], 2);
        assert_eq!(dispatch.data.as_ref().unwrap()["failed"], 0);

        {
            let core = f.orchestrator.core();
            let state = core.state.lock().await;
            assert!(state.graph.all_terminal());
            assert_eq!(state.graph.completion_rate(), 1.0);
        }

        let verify = exec(&f, "VERIFY", json!({})).await;
        assert!(verify.success);
        assert!(verify.should_stop);
        assert_eq!(f.orchestrator.phase().await, Phase::Completed);

        let types = event_types(&f.bus);
        assert!(types.contains(&"epic.phase_transition".to_string()));
        assert!(types.contains(&"workflow_progress".to_string()));
        assert!(types.contains(&"resource.allocated".to_string()));
        assert!(types.contains(&"resource.released".to_string()));
        assert!(types.contains(&"epic.completed".to_string()));

        let progress = f.bus.get_history_by_type("workflow_progress", None);
        assert_eq!(progress.last().unwrap().payload["percent"], 100.0);

        // Tasks were mirrored to the tracker and the epic closed.
        {
            let core = f.orchestrator.core();
            let state = core.state.lock().await;
            for task in state.graph.tasks() {
                assert!(task.tracker_id.is_some());
            }
        }
        let epic_id = f.orchestrator.core().tracker_epic.lock().await.clone().unwrap();
        assert!(f.tracker.epic_closed(&epic_id));
    }

    #[tokio::test]
    async fn test_resource_shortage_then_recovery() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("searcher-1", &[("web_search", 8)])]);

        let plan = exec(
            &f,
            "PLAN",
            json!({"tasks": [
                {"id": "task-1", "description": "search the web for topic A"},
                {"id": "task-2", "description": "search the web for topic B"}
            ]}),
        )
        .await;
        assert!(plan.success);

        // Two search tasks, one web_search executor: shortage.
        let dispatch = exec(&f, "PARALLEL_DISPATCH", json!({})).await;
        assert!(!dispatch.success);
        assert!(dispatch.error.as_ref().unwrap().contains("resource_shortage"));
        assert_eq!(f.orchestrator.phase().await, Phase::BlockedReview);

        let types = event_types(&f.bus);
        assert!(types.contains(&"resource_shortage".to_string()));
        let transitions = f.bus.get_history_by_type("epic.phase_transition", None);
        let last = transitions.last().unwrap();
        assert_eq!(last.payload["to"], "blocked_review");
        assert_eq!(last.payload["triggerAction"], "resource_shortage");

        // Nothing was completed and the pool is whole again.
        {
            let core = f.orchestrator.core();
            let state = core.state.lock().await;
            assert_eq!(state.graph.completed_count(), 0);
            assert_eq!(f.pool.lock().await.available_resource_ids().len(), 1);
        }

        // Recovery: add a second searcher, START, dispatch again.
        f.pool
            .lock()
            .await
            .add_resource(default_executor("searcher-2", &[("web_search", 7)]))
            .unwrap();
        let start = exec(&f, "START", json!({})).await;
        assert!(start.success, "{:?}", start.error);

        let dispatch = exec(&f, "PARALLEL_DISPATCH", json!({})).await;
        assert!(dispatch.success, "{:?}", dispatch.error);
        assert_eq!(dispatch.data.unwrap()["completed"], 2);
    }

    #[tokio::test]
    async fn test_start_refused_while_resources_still_missing() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("searcher-1", &[("web_search", 8)])]);
        exec(
            &f,
            "PLAN",
            json!({"tasks": [
                {"id": "task-1", "description": "search for A"},
                {"id": "task-2", "description": "search for B"}
            ]}),
        )
        .await;
        exec(&f, "PARALLEL_DISPATCH", json!({})).await;
        assert_eq!(f.orchestrator.phase().await, Phase::BlockedReview);

        // Starve the pool completely so the per-task re-check refuses.
        let only = { f.pool.lock().await.available_resource_ids()[0].clone() };
        f.pool.lock().await.remove_resource(&only).unwrap();
        let start = exec(&f, "START", json!({})).await;
        assert!(!start.success);
        assert!(start.error.unwrap().contains("START refused"));
    }

    #[tokio::test]
    async fn test_start_refused_from_wrong_phase() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[]);
        let start = exec(&f, "START", json!({})).await;
        assert!(!start.success);
        assert!(start.error.unwrap().contains("understanding"));
    }

    #[tokio::test]
    async fn test_stop_routes_on_reason() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[]);

        let stop = exec(&f, "STOP", json!({"reason": "waiting on resource restock"})).await;
        assert!(stop.success);
        assert_eq!(f.orchestrator.phase().await, Phase::BlockedReview);

        let stop = exec(&f, "STOP", json!({"reason": "user asked to hold"})).await;
        assert!(stop.success);
        assert_eq!(f.orchestrator.phase().await, Phase::Paused);

        // START from paused is allowed.
        let start = exec(&f, "START", json!({})).await;
        assert!(start.success);
    }

    #[tokio::test]
    async fn test_design_phases_record_artifacts() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[]);

        assert!(exec(&f, "HIGH_DESIGN", json!({"content": "two files, one pass"})).await.success);
        assert_eq!(f.orchestrator.phase().await, Phase::HighDesign);

        assert!(exec(&f, "DETAIL_DESIGN", json!({"content": "write X then Y"})).await.success);
        assert!(
            exec(&f, "DELIVERABLES", json!({"artifacts": ["file X", "file Y"]}))
                .await
                .success
        );
        assert_eq!(f.orchestrator.phase().await, Phase::Deliverables);

        let core = f.orchestrator.core();
        let state = core.state.lock().await;
        assert_eq!(state.artifacts.high_design.as_deref(), Some("two files, one pass"));
        assert_eq!(state.artifacts.deliverables.len(), 2);
        drop(state);

        // Artifact phases leave a tracker comment and nothing else.
        let epic_id = f.orchestrator.core().tracker_epic.lock().await.clone().unwrap();
        assert_eq!(f.tracker.epic_comments(&epic_id).len(), 3);

        let empty = exec(&f, "HIGH_DESIGN", json!({"content": "  "})).await;
        assert!(!empty.success);
    }

    #[tokio::test]
    async fn test_verify_vacuous_artifact_check() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])]);
        exec(&f, "PLAN", two_file_tasks()).await;
        exec(&f, "PARALLEL_DISPATCH", json!({})).await;

        // No deliverables declared: VERIFY gates only on completion rate.
        let verify = exec(&f, "VERIFY", json!({})).await;
        assert!(verify.success);
        assert_eq!(f.orchestrator.phase().await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_verify_fails_below_threshold_without_stopping() {
        let f = fixture_with(
            ScriptedDispatcher::failing(&["task-2"]),
            &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])],
        );
        exec(&f, "PLAN", two_file_tasks()).await;
        exec(&f, "PARALLEL_DISPATCH", json!({})).await;

        // 1 of 2 completed: below the 0.8 threshold.
        let verify = exec(&f, "VERIFY", json!({})).await;
        assert!(!verify.success);
        assert!(!verify.should_stop, "VERIFY failure returns without stopping");
        assert!(verify.error.unwrap().contains("50%"));
        assert_ne!(f.orchestrator.phase().await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_verify_checks_artifact_coverage() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])]);
        exec(&f, "DELIVERABLES", json!({"artifacts": ["deployment manifest"]})).await;
        exec(&f, "PLAN", two_file_tasks()).await;
        exec(&f, "PARALLEL_DISPATCH", json!({})).await;

        // 100% completion but no completed task mentions the artifact.
        let verify = exec(&f, "VERIFY", json!({})).await;
        assert!(!verify.success);
        assert!(verify.data.unwrap()["missingArtifacts"][0] == json!("deployment manifest"));
    }

    #[tokio::test]
    async fn test_complete_requires_terminal_graph() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[]);
        exec(&f, "PLAN", two_file_tasks()).await;

        let complete = exec(&f, "COMPLETE", json!({})).await;
        assert!(!complete.success);
        assert!(complete.error.unwrap().contains("terminal"));
    }

    #[tokio::test]
    async fn test_fail_is_terminal_with_event() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[]);
        let fail = exec(&f, "FAIL", json!({"reason": "unworkable request"})).await;
        assert!(fail.should_stop);
        assert_eq!(f.orchestrator.phase().await, Phase::Failed);

        let completed = f.bus.get_history_by_type("epic.completed", None);
        assert_eq!(completed[0].payload["success"], false);
    }

    #[tokio::test]
    async fn test_checkpoint_task_failure_escalates_on_repeat() {
        let f = fixture_with(
            ScriptedDispatcher::failing(&["task-1", "task-2"]),
            &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])],
        );
        exec(&f, "PLAN", two_file_tasks()).await;
        exec(&f, "PARALLEL_DISPATCH", json!({})).await;

        // First failure checkpoint records, second escalates.
        let first = exec(&f, "CHECKPOINT", json!({"trigger": "task_failure"})).await;
        assert!(first.success);

        let second = exec(&f, "CHECKPOINT", json!({"trigger": "task_failure"})).await;
        assert!(second.should_stop);
        assert_eq!(second.stop_reason, Some(crate::actions::StopReason::Escalate));
        assert_eq!(f.orchestrator.phase().await, Phase::Replanning);
    }

    #[tokio::test]
    async fn test_query_capabilities_is_nonmutating() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("exec-a", &[("file_ops", 9)])]);
        let before = f.orchestrator.phase().await;

        let query = exec(&f, "QUERY_CAPABILITIES", json!({})).await;
        assert!(query.success);
        let data = query.data.unwrap();
        assert!(data["catalog"]["file_ops"].is_array());
        assert_eq!(data["status"]["available"], 1);
        assert_eq!(f.orchestrator.phase().await, before);
    }

    #[tokio::test]
    async fn test_resume_restores_graph_and_phase() {
        let f = fixture_with(
            ScriptedDispatcher::failing(&["task-2"]),
            &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])],
        );
        exec(&f, "PLAN", two_file_tasks()).await;
        exec(&f, "PARALLEL_DISPATCH", json!({"task_ids": ["task-1"]})).await;
        // task-1 completed; checkpoint written by the dispatch handler.

        let resumed = Orchestrator::resume(
            "sess-1",
            "wf-1",
            f.pool.clone(),
            f.tracker.clone(),
            f.bus.clone(),
            f.checkpoints.clone(),
            ScriptedDispatcher::ok(),
            OrchestratorConfig::default(),
        )
        .await;

        assert_eq!(resumed.phase().await, Phase::ParallelDispatch);
        assert_eq!(resumed.core().user_task, "build file X and file Y");
        {
            let core = resumed.core();
            let state = core.state.lock().await;
            assert_eq!(state.graph.get("task-1").unwrap().status, TaskStatus::Completed);
            assert_eq!(state.graph.get("task-2").unwrap().status, TaskStatus::Ready);
        }

        // The remaining task completes under the resumed machine.
        let registry = resumed.build_registry();
        let ctx = ActionContext::new("sess-1", "/tmp");
        let dispatch = registry.execute("PARALLEL_DISPATCH", json!({}), &ctx).await;
        assert!(dispatch.success, "{:?}", dispatch.error);
        let core = resumed.core();
        let state = core.state.lock().await;
        assert_eq!(state.graph.get("task-2").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_defaults_to_replanning() {
        let temp = tempdir().unwrap();
        let resumed = Orchestrator::resume(
            "sess-unknown",
            "wf-1",
            Arc::new(Mutex::new(ResourcePool::in_memory())),
            Arc::new(MemoryTracker::new()),
            EventBus::with_default_capacity(),
            Arc::new(CheckpointStore::new(temp.path())),
            ScriptedDispatcher::ok(),
            OrchestratorConfig::default(),
        )
        .await;
        assert_eq!(resumed.phase().await, Phase::Replanning);
    }

    #[tokio::test]
    async fn test_full_run_with_scripted_planner() {
        let f = fixture_with(
            ScriptedDispatcher::ok(),
            &[("exec-a", &[("file_ops", 10)]), ("exec-b", &[("file_ops", 10)])],
        );

        let planner = Arc::new(ScriptedAgent::new(
            "planner-1",
            vec![
                r#"{"thought": "sketch", "action": "HIGH_DESIGN", "params": {"content": "two files"}}"#,
                r#"{"thought": "plan it", "action": "PLAN", "params": {"tasks": [
                    {"id": "task-1", "description": "create file X"},
                    {"id": "task-2", "description": "create file Y"}
                ]}}"#,
                r#"{"thought": "dispatch", "action": "PARALLEL_DISPATCH", "params": {}}"#,
                r#"{"thought": "check", "action": "VERIFY", "params": {}}"#,
            ],
        ));

        let temp = tempdir().unwrap();
        let outcome = f.orchestrator.run(planner, temp.path()).await.unwrap();
        assert_eq!(outcome.status, ReactStatus::Complete);
        assert_eq!(f.orchestrator.phase().await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_blocked_review_dispatches_unblocked_dependents() {
        let f = fixture_with(ScriptedDispatcher::ok(), &[("exec-a", &[("file_ops", 10)])]);
        exec(
            &f,
            "PLAN",
            json!({"tasks": [
                {"id": "task-1", "description": "create file X"},
                {"id": "task-2", "description": "create file Y", "dependencies": ["task-1"]}
            ]}),
        )
        .await;

        // Only task-1 is ready; dispatch it.
        let dispatch = exec(&f, "PARALLEL_DISPATCH", json!({"task_ids": ["task-1"]})).await;
        assert!(dispatch.success);

        // task-2's dependency is now satisfied; blocked review picks it up.
        let review = exec(&f, "BLOCKED_REVIEW", json!({})).await;
        assert!(review.success, "{:?}", review.error);
        let core = f.orchestrator.core();
        let state = core.state.lock().await;
        assert_eq!(state.graph.get("task-2").unwrap().status, TaskStatus::Completed);
    }
}
