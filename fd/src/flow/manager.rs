//! LoopManager - loop lifecycle, node growth, context compression
//!
//! Owns every [`EpicTaskFlow`] and the loop cache. A loop moves
//! queue -> running -> history exactly once; at most one loop per epic
//! runs at a time; nodes are append-only. Each lifecycle step emits an
//! event on the bus. Resource allocation is delegated to the pool with
//! `resource.allocated`/`resource.released` emitted on success.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::pool::{AllocationResult, ReleaseReason, Requirement, ResourcePool};

use super::types::{
    CompressedContext, ContextWindow, EpicTaskFlow, Loop, LoopNode, LoopPhase, LoopResult, LoopStatus, NodeDraft,
    NodeStatus, NodeType, PendingInput,
};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown epic: {0}")]
    UnknownEpic(String),

    #[error("unknown loop: {0}")]
    UnknownLoop(String),

    #[error("unknown node {node_id} in loop {loop_id}")]
    UnknownNode { loop_id: String, node_id: String },

    #[error("loop {0} is not in queue (status {1:?})")]
    NotQueued(String, LoopStatus),

    #[error("epic {0} already has a running loop ({1})")]
    AlreadyRunning(String, String),

    #[error("loop {0} is not running (status {1:?})")]
    NotRunning(String, LoopStatus),

    #[error("node {0} is already terminal")]
    NodeTerminal(String),

    #[error("no pending input for epic {0}")]
    NoPendingInput(String),

    #[error("pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),
}

/// Tuning for context compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Most-recent historical loops preserved verbatim
    pub preserved_cycles: usize,
    /// Token budget per epic
    pub max_tokens: u64,
    /// Compression trigger threshold in tokens
    pub threshold_tokens: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            preserved_cycles: 3,
            max_tokens: 100_000,
            threshold_tokens: 60_000,
        }
    }
}

/// Owner of epic flows and the loop cache
pub struct LoopManager {
    loops: HashMap<String, Loop>,
    flows: HashMap<String, EpicTaskFlow>,
    pending_inputs: HashMap<String, PendingInput>,
    bus: Arc<EventBus>,
    pool: Arc<Mutex<ResourcePool>>,
    compression: CompressionConfig,
}

impl LoopManager {
    pub fn new(bus: Arc<EventBus>, pool: Arc<Mutex<ResourcePool>>, compression: CompressionConfig) -> Self {
        Self {
            loops: HashMap::new(),
            flows: HashMap::new(),
            pending_inputs: HashMap::new(),
            bus,
            pool,
            compression,
        }
    }

    // === Epic lifecycle ===

    /// Register an epic's flow. Emits `epic.created`.
    pub fn create_epic(&mut self, epic_id: impl Into<String>, session_id: impl Into<String>) -> &EpicTaskFlow {
        let epic_id = epic_id.into();
        let session_id = session_id.into();
        debug!(%epic_id, %session_id, "LoopManager::create_epic");

        let window = ContextWindow::new(self.compression.max_tokens, self.compression.threshold_tokens);
        let flow = EpicTaskFlow::new(epic_id.clone(), session_id.clone(), window);
        self.bus
            .emit(Event::new("epic.created", session_id, json!({"epicId": epic_id.clone()})));
        self.flows.entry(epic_id).or_insert(flow)
    }

    pub fn get_flow(&self, epic_id: &str) -> Option<&EpicTaskFlow> {
        self.flows.get(epic_id)
    }

    pub fn get_loop(&self, loop_id: &str) -> Option<&Loop> {
        self.loops.get(loop_id)
    }

    fn session_of(&self, epic_id: &str) -> String {
        self.flows
            .get(epic_id)
            .map(|f| f.session_id.clone())
            .unwrap_or_else(|| epic_id.to_string())
    }

    // === Loop lifecycle ===

    /// Create a loop in `queue` status. Emits `loop.created`.
    pub fn create_loop(
        &mut self,
        epic_id: &str,
        phase: LoopPhase,
        source_loop_id: Option<String>,
    ) -> Result<Loop, FlowError> {
        if !self.flows.contains_key(epic_id) {
            self.create_epic(epic_id.to_string(), epic_id.to_string());
        }
        let flow = self
            .flows
            .get_mut(epic_id)
            .ok_or_else(|| FlowError::UnknownEpic(epic_id.to_string()))?;
        flow.loop_seq += 1;

        let new_loop = Loop {
            id: format!("L-{}-{}-{}", epic_id, phase.as_str(), flow.loop_seq),
            epic_id: epic_id.to_string(),
            phase,
            status: LoopStatus::Queue,
            nodes: Vec::new(),
            source_loop_id,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            node_seq: 0,
        };

        info!(loop_id = %new_loop.id, %epic_id, phase = phase.as_str(), "loop created");
        self.loops.insert(new_loop.id.clone(), new_loop.clone());
        self.bus.emit(
            Event::new(
                "loop.created",
                self.session_of(epic_id),
                json!({"loopId": new_loop.id.clone(), "epicId": epic_id, "phase": phase.as_str()}),
            )
            .with_workflow(epic_id.to_string()),
        );
        Ok(new_loop)
    }

    /// Append a loop to its epic's queue. Emits `loop.queued`.
    pub fn queue_loop(&mut self, loop_id: &str) -> Result<(), FlowError> {
        let (epic_id, status) = {
            let lp = self
                .loops
                .get(loop_id)
                .ok_or_else(|| FlowError::UnknownLoop(loop_id.to_string()))?;
            (lp.epic_id.clone(), lp.status)
        };
        if status != LoopStatus::Queue {
            return Err(FlowError::NotQueued(loop_id.to_string(), status));
        }

        let flow = self
            .flows
            .get_mut(&epic_id)
            .ok_or_else(|| FlowError::UnknownEpic(epic_id.clone()))?;
        if !flow.queue.contains(&loop_id.to_string()) {
            flow.queue.push_back(loop_id.to_string());
        }

        self.bus.emit(
            Event::new(
                "loop.queued",
                self.session_of(&epic_id),
                json!({"loopId": loop_id, "epicId": epic_id.clone()}),
            )
            .with_workflow(epic_id),
        );
        Ok(())
    }

    /// Move a loop from queue to running. Rejected when the loop is not
    /// queued or the epic already runs another loop. Emits `loop.started`.
    pub fn start_loop(&mut self, loop_id: &str) -> Result<(), FlowError> {
        let epic_id = {
            let lp = self
                .loops
                .get(loop_id)
                .ok_or_else(|| FlowError::UnknownLoop(loop_id.to_string()))?;
            if lp.status != LoopStatus::Queue {
                return Err(FlowError::NotQueued(loop_id.to_string(), lp.status));
            }
            lp.epic_id.clone()
        };

        let flow = self
            .flows
            .get_mut(&epic_id)
            .ok_or_else(|| FlowError::UnknownEpic(epic_id.clone()))?;
        if let Some(running) = &flow.running {
            return Err(FlowError::AlreadyRunning(epic_id.clone(), running.clone()));
        }

        flow.queue.retain(|id| id != loop_id);
        flow.running = Some(loop_id.to_string());

        if let Some(lp) = self.loops.get_mut(loop_id) {
            lp.status = LoopStatus::Running;
            lp.started_at = Some(chrono::Utc::now());
        }

        info!(%loop_id, %epic_id, "loop started");
        self.bus.emit(
            Event::new(
                "loop.started",
                self.session_of(&epic_id),
                json!({"loopId": loop_id, "epicId": epic_id.clone()}),
            )
            .with_workflow(epic_id),
        );
        Ok(())
    }

    /// Finish a running loop into its phase history. Emits
    /// `loop.completed`, then evaluates context compression.
    pub fn complete_loop(&mut self, loop_id: &str, result: LoopResult) -> Result<(), FlowError> {
        let (epic_id, phase) = {
            let lp = self
                .loops
                .get_mut(loop_id)
                .ok_or_else(|| FlowError::UnknownLoop(loop_id.to_string()))?;
            if lp.status != LoopStatus::Running {
                return Err(FlowError::NotRunning(loop_id.to_string(), lp.status));
            }
            lp.status = LoopStatus::History;
            lp.completed_at = Some(chrono::Utc::now());
            lp.result = Some(result.clone());
            (lp.epic_id.clone(), lp.phase)
        };

        let token_delta = self.loops.get(loop_id).map(|l| l.token_estimate()).unwrap_or(0);
        let flow = self
            .flows
            .get_mut(&epic_id)
            .ok_or_else(|| FlowError::UnknownEpic(epic_id.clone()))?;
        if flow.running.as_deref() == Some(loop_id) {
            flow.running = None;
        }
        flow.history_for_mut(phase).push(loop_id.to_string());
        flow.context_window.used_tokens += token_delta;

        info!(%loop_id, %epic_id, success = result.success, "loop completed");
        self.bus.emit(
            Event::new(
                "loop.completed",
                self.session_of(&epic_id),
                json!({
                    "loopId": loop_id,
                    "epicId": epic_id.clone(),
                    "result": if result.success { "complete" } else { "failed" },
                    "detail": result.detail.clone(),
                }),
            )
            .with_workflow(epic_id.clone()),
        );

        self.check_context_compression(&epic_id);
        Ok(())
    }

    // === Nodes ===

    /// Append a node to a loop, assigning its identity and timestamp.
    /// Emits `loop.node.updated`.
    pub fn add_node(&mut self, loop_id: &str, draft: NodeDraft) -> Result<LoopNode, FlowError> {
        let (node, epic_id) = {
            let lp = self
                .loops
                .get_mut(loop_id)
                .ok_or_else(|| FlowError::UnknownLoop(loop_id.to_string()))?;
            lp.node_seq += 1;
            let node = LoopNode {
                id: format!("N-{}-{}", loop_id, lp.node_seq),
                node_type: draft.node_type,
                status: draft.status,
                title: draft.title,
                text: draft.text,
                agent_id: draft.agent_id,
                metadata: draft.metadata,
                timestamp: chrono::Utc::now(),
            };
            lp.nodes.push(node.clone());
            (node, lp.epic_id.clone())
        };

        debug!(%loop_id, node_id = %node.id, node_type = ?node.node_type, "node added");
        let mut event = Event::new(
            "loop.node.updated",
            self.session_of(&epic_id),
            json!({
                "loopId": loop_id,
                "nodeId": node.id.clone(),
                "type": node.node_type,
                "status": node.status,
                "title": node.title.clone(),
            }),
        )
        .with_workflow(epic_id);
        if let Some(agent) = &node.agent_id {
            event = event.with_agent(agent.clone());
        }
        self.bus.emit(event);
        Ok(node)
    }

    /// Update a node's status. Terminal statuses are final; a terminal
    /// node additionally emits `loop.node.completed`.
    pub fn update_node_status(&mut self, loop_id: &str, node_id: &str, status: NodeStatus) -> Result<(), FlowError> {
        let epic_id = {
            let lp = self
                .loops
                .get_mut(loop_id)
                .ok_or_else(|| FlowError::UnknownLoop(loop_id.to_string()))?;
            let node = lp
                .nodes
                .iter_mut()
                .find(|n| n.id == node_id)
                .ok_or_else(|| FlowError::UnknownNode {
                    loop_id: loop_id.to_string(),
                    node_id: node_id.to_string(),
                })?;
            if node.status.is_terminal() {
                return Err(FlowError::NodeTerminal(node_id.to_string()));
            }
            node.status = status;
            lp.epic_id.clone()
        };

        let session = self.session_of(&epic_id);
        self.bus.emit(
            Event::new(
                "loop.node.updated",
                session.clone(),
                json!({"loopId": loop_id, "nodeId": node_id, "status": status}),
            )
            .with_workflow(epic_id.clone()),
        );
        if status.is_terminal() {
            self.bus.emit(
                Event::new(
                    "loop.node.completed",
                    session,
                    json!({"loopId": loop_id, "nodeId": node_id, "status": status}),
                )
                .with_workflow(epic_id),
            );
        }
        Ok(())
    }

    // === User input ===

    /// Create a waiting `user` node on the epic's running loop and
    /// register a pending input. Emits `epic.user_input_required`.
    pub fn request_user_input(
        &mut self,
        epic_id: &str,
        question: impl Into<String>,
        options: Option<Vec<String>>,
        context: Option<serde_json::Value>,
    ) -> Result<PendingInput, FlowError> {
        let question = question.into();
        let loop_id = self
            .flows
            .get(epic_id)
            .ok_or_else(|| FlowError::UnknownEpic(epic_id.to_string()))?
            .running
            .clone()
            .ok_or_else(|| FlowError::UnknownLoop(format!("no running loop for epic {}", epic_id)))?;

        let node = self.add_node(
            &loop_id,
            NodeDraft::new(NodeType::User, "user input required", question.clone())
                .with_status(NodeStatus::Waiting),
        )?;

        let pending = PendingInput {
            epic_id: epic_id.to_string(),
            loop_id,
            node_id: node.id.clone(),
            question: question.clone(),
            options: options.clone(),
            context,
            created_at: chrono::Utc::now(),
        };
        self.pending_inputs.insert(epic_id.to_string(), pending.clone());

        info!(%epic_id, node_id = %node.id, "user input required");
        self.bus.emit(
            Event::new(
                "epic.user_input_required",
                self.session_of(epic_id),
                json!({"epicId": epic_id, "question": question.clone(), "options": options.clone(), "nodeId": node.id.clone()}),
            )
            .with_workflow(epic_id.to_string()),
        );
        Ok(pending)
    }

    /// Resolve a pending input: the waiting node is marked done with the
    /// response appended, and the pending entry is cleared.
    pub fn receive_user_input(&mut self, epic_id: &str, response: &str) -> Result<(), FlowError> {
        let pending = self
            .pending_inputs
            .remove(epic_id)
            .ok_or_else(|| FlowError::NoPendingInput(epic_id.to_string()))?;

        if let Some(lp) = self.loops.get_mut(&pending.loop_id)
            && let Some(node) = lp.nodes.iter_mut().find(|n| n.id == pending.node_id)
        {
            node.text = format!("{}\n-> {}", node.text, response);
        }
        self.update_node_status(&pending.loop_id, &pending.node_id, NodeStatus::Done)?;

        self.bus.emit(
            Event::new(
                "epic.user_input_received",
                self.session_of(epic_id),
                json!({"epicId": epic_id, "nodeId": pending.node_id}),
            )
            .with_workflow(epic_id.to_string()),
        );
        Ok(())
    }

    pub fn pending_input(&self, epic_id: &str) -> Option<&PendingInput> {
        self.pending_inputs.get(epic_id)
    }

    // === Context compression ===

    /// Evaluate the two compression triggers and compress when both hold:
    /// more historical loops than `preserved_cycles`, and used tokens over
    /// the threshold.
    pub fn check_context_compression(&mut self, epic_id: &str) {
        let Some(flow) = self.flows.get(epic_id) else {
            return;
        };
        let history_count = flow.all_history().len();
        let over_threshold = flow.context_window.used_tokens > flow.context_window.compression_threshold;

        if history_count > self.compression.preserved_cycles && over_threshold {
            debug!(%epic_id, history_count, used = flow.context_window.used_tokens, "compression triggered");
            self.compress_context(epic_id);
        }
    }

    /// Summarize older historical loops, preserving the most recent
    /// `preserved_cycles` verbatim. Compression is advisory: preserved
    /// loops and their nodes are untouched; only the token accounting and
    /// the stored summary change. Emits `context.compressed`.
    pub fn compress_context(&mut self, epic_id: &str) {
        let Some(flow) = self.flows.get(epic_id) else {
            return;
        };

        // Order history by completion time to find the preserved tail.
        let mut history: Vec<&Loop> = flow.all_history().iter().filter_map(|id| self.loops.get(id)).collect();
        history.sort_by_key(|l| l.completed_at);

        let preserved = self.compression.preserved_cycles.min(history.len());
        let older = &history[..history.len() - preserved];
        if older.is_empty() {
            return;
        }

        let original_tokens = flow.context_window.used_tokens;

        // The summary keeps decisions recorded on orchestrator nodes.
        let mut summary_lines: Vec<String> = Vec::new();
        for lp in older {
            for node in &lp.nodes {
                if node.node_type == NodeType::Orch
                    && let Some(decision) = node.metadata.as_ref().and_then(|m| m.get("decision"))
                {
                    let decision_text = decision.as_str().map(str::to_string).unwrap_or_else(|| decision.to_string());
                    summary_lines.push(format!("[{}] {}", lp.id, decision_text));
                }
            }
        }
        let summary = if summary_lines.is_empty() {
            format!("{} earlier loop(s) compressed; no recorded decisions", older.len())
        } else {
            summary_lines.join("\n")
        };

        let preserved_tokens: u64 = history[history.len() - preserved..]
            .iter()
            .map(|l| l.token_estimate())
            .sum();
        let summary_tokens = (summary.len() / 4) as u64;
        let compressed_tokens = preserved_tokens + summary_tokens;

        let Some(flow) = self.flows.get_mut(epic_id) else {
            return;
        };
        flow.context_window.used_tokens = compressed_tokens;
        flow.compressed_context = Some(CompressedContext {
            original_tokens,
            compressed_tokens,
            summary,
            preserved_cycles: preserved,
            timestamp: chrono::Utc::now(),
        });

        info!(%epic_id, original_tokens, compressed_tokens, "context compressed");
        self.bus.emit(
            Event::new(
                "context.compressed",
                self.session_of(epic_id),
                json!({
                    "epicId": epic_id,
                    "originalTokens": original_tokens,
                    "compressedTokens": compressed_tokens,
                    "preservedCycles": preserved,
                }),
            )
            .with_workflow(epic_id.to_string()),
        );
    }

    // === Resource delegation ===

    /// Proxy to the pool; emits `resource.allocated` on success.
    pub async fn allocate_resources(&self, task_id: &str, requirements: &[Requirement]) -> AllocationResult {
        let result = self.pool.lock().await.allocate_resources(task_id, requirements);
        if result.success {
            self.bus.emit(
                Event::new(
                    "resource.allocated",
                    String::new(),
                    json!({"taskId": task_id, "resources": result.allocated_resources.clone()}),
                )
                .with_task(task_id.to_string()),
            );
        }
        result
    }

    /// Proxy to the pool; emits `resource.released` on success.
    pub async fn release_resources(&self, task_id: &str, reason: ReleaseReason) -> Result<Vec<String>, FlowError> {
        match self.pool.lock().await.release_resources(task_id, reason) {
            Ok(released) => {
                self.bus.emit(
                    Event::new(
                        "resource.released",
                        String::new(),
                        json!({"taskId": task_id, "resources": released.clone()}),
                    )
                    .with_task(task_id.to_string()),
                );
                Ok(released)
            }
            Err(e) => {
                warn!(%task_id, error = %e, "release_resources failed");
                Err(e.into())
            }
        }
    }
}
