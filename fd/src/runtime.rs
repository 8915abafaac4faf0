//! Daemon runtime - builds every component and runs the server
//!
//! This is what `fd run-server` executes inside the detached child the
//! supervisor spawns: event bus (with JSONL persistence), mailbox,
//! resource pool, loop manager, session manager, kernel bridge, agent
//! router, heartbeat, and the axum surface.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{
    Config, checkpoints_dir, diagnostics_dir, event_logs_dir, finger_home, pool_path,
};
use crate::daemon::DaemonSupervisor;
use crate::events::{Event, EventBus};
use crate::executor::{ExecutorConfig, ExecutorLoop, KernelTaskDispatcher};
use crate::flow::{CompressionConfig, LoopManager, LoopPhase, LoopResult};
use crate::kernel::{BridgeConfig, KernelBridge};
use crate::mailbox::Mailbox;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::react::{JsonlSnapshotLogger, KernelAgent, ReactStatus};
use crate::server::{AgentRouter, AppState};
use crate::session::SessionManager;
use crate::tracker::{MemoryTracker, Tracker};

use sessionstore::CheckpointStore;

/// Message types the hub routes, matching the CLI command table
const KNOWN_TARGETS: &[&str] = &[
    "understanding-agent",
    "router-agent",
    "planner-agent",
    "executor-agent",
    "reviewer-agent",
    "orchestrator",
];

/// Everything the router needs to run agents on behalf of a message
struct DaemonRouter {
    config: Config,
    home: std::path::PathBuf,
    bus: Arc<EventBus>,
    pool: Arc<Mutex<crate::pool::ResourcePool>>,
    tracker: Arc<dyn Tracker>,
    checkpoints: Arc<CheckpointStore>,
    bridge: Arc<KernelBridge>,
    loops: Arc<Mutex<LoopManager>>,
    sessions: Arc<Mutex<SessionManager>>,
}

impl DaemonRouter {
    fn task_text(message: &Value) -> String {
        message["task"]
            .as_str()
            .or_else(|| message["text"].as_str())
            .or_else(|| message.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Run the full orchestration pipeline for one user task
    async fn orchestrate(&self, task: &str) -> Result<Value, String> {
        if task.trim().is_empty() {
            return Err("empty task".to_string());
        }

        let session = {
            let mut sessions = self.sessions.lock().await;
            let cwd = std::env::current_dir().unwrap_or_else(|_| self.home.clone());
            sessions
                .create_session(task, &cwd)
                .map_err(|e| format!("session creation failed: {}", e))?
        };
        let workflow_id = format!("wf-{}", Uuid::now_v7());
        {
            let mut sessions = self.sessions.lock().await;
            let _ = sessions.add_workflow(&session.id, &workflow_id);
        }

        // One loop per orchestration run, visible on the event stream.
        let loop_id = {
            let mut loops = self.loops.lock().await;
            loops.create_epic(workflow_id.clone(), session.id.clone());
            let lp = loops
                .create_loop(&workflow_id, LoopPhase::Plan, None)
                .map_err(|e| e.to_string())?;
            loops.queue_loop(&lp.id).map_err(|e| e.to_string())?;
            loops.start_loop(&lp.id).map_err(|e| e.to_string())?;
            lp.id
        };

        let dispatcher = Arc::new(KernelTaskDispatcher::new(
            self.tracker.clone(),
            self.bus.clone(),
            self.bridge.clone(),
            &self.config.kernel.binary,
            &self.config.kernel.provider,
            &session.project_dir,
            ExecutorConfig {
                max_iterations: self.config.react.executor_max_iterations,
                fresh_session_per_round: true,
            },
        ));

        let orchestrator = Orchestrator::new(
            &session.id,
            &workflow_id,
            task,
            self.pool.clone(),
            self.tracker.clone(),
            self.bus.clone(),
            self.checkpoints.clone(),
            dispatcher,
            OrchestratorConfig {
                capability_rules: self.config.pool.effective_rules(),
                max_rounds: self.config.react.orchestrator_max_rounds,
                ..Default::default()
            },
        );

        let planner_id = format!("orchestrator-{}", workflow_id);
        let planner = Arc::new(KernelAgent::new(
            &planner_id,
            session.id.clone(),
            &self.config.kernel.provider,
            &self.config.kernel.binary,
            self.bridge.clone(),
        ));

        let outcome = orchestrator
            .run(planner, &session.project_dir)
            .await
            .map_err(|e| e.to_string())?;

        let success = outcome.status == ReactStatus::Complete;
        {
            let mut loops = self.loops.lock().await;
            let result = if success {
                LoopResult::ok()
            } else {
                LoopResult::failed(format!("{:?}", outcome.status))
            };
            let _ = loops.complete_loop(&loop_id, result);
        }

        let phase = orchestrator.phase().await;
        let result = json!({
            "success": success,
            "phase": phase.as_str(),
            "rounds": outcome.rounds,
            "sessionId": session.id,
            "workflowId": workflow_id,
            "lastObservation": outcome.last_observation,
            "error": outcome.last_error,
        });
        if success { Ok(result) } else { Err(result.to_string()) }
    }

    /// Run a single executor pass over the given task text
    async fn execute_single(&self, task: &str) -> Result<Value, String> {
        if task.trim().is_empty() {
            return Err("empty task".to_string());
        }
        let task_id = format!("task-{}", Uuid::now_v7());
        let session_id = format!("exec-{}", task_id);
        let agent_id = format!("executor-{}", task_id);
        let agent = Arc::new(KernelAgent::new(
            agent_id.clone(),
            session_id.clone(),
            &self.config.kernel.provider,
            &self.config.kernel.binary,
            self.bridge.clone(),
        ));
        let workdir = std::env::current_dir().unwrap_or_else(|_| self.home.clone());
        let executor = ExecutorLoop::new(
            agent,
            self.tracker.clone(),
            self.bus.clone(),
            ExecutorConfig {
                max_iterations: self.config.react.executor_max_iterations,
                fresh_session_per_round: true,
            },
            workdir,
        )
        .with_snapshots(Arc::new(JsonlSnapshotLogger::new(
            diagnostics_dir(&self.home).join(format!("{}.prompt-injection.jsonl", agent_id)),
        )));

        let outcome = executor.execute_task(&session_id, None, &task_id, task, None).await;
        if outcome.success {
            Ok(json!({"observation": outcome.observation, "taskId": task_id}))
        } else {
            Err(outcome.error.unwrap_or_else(|| "execution failed".to_string()))
        }
    }

    /// Single kernel turn for the light-weight agents (understand, route,
    /// plan, review): the agent's text answer is the result.
    async fn single_turn(&self, target: &str, task: &str) -> Result<Value, String> {
        if task.trim().is_empty() {
            return Err("empty task".to_string());
        }
        let session_id = format!("{}-{}", target, Uuid::now_v7());
        let agent = KernelAgent::new(
            target,
            session_id,
            &self.config.kernel.provider,
            &self.config.kernel.binary,
            self.bridge.clone(),
        );
        use crate::react::Agent;
        agent
            .generate(task)
            .await
            .map(|answer| json!({"answer": answer}))
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AgentRouter for DaemonRouter {
    async fn handle(&self, target: &str, message: Value) -> Result<Value, String> {
        if !KNOWN_TARGETS.contains(&target) {
            return Err(format!("unknown target agent: {}", target));
        }
        let task = Self::task_text(&message);
        info!(%target, task_len = task.len(), "routing message");

        match target {
            "orchestrator" => self.orchestrate(&task).await,
            "executor-agent" => self.execute_single(&task).await,
            _ => self.single_turn(target, &task).await,
        }
    }
}

/// Build all daemon components and serve until the process is stopped
pub async fn run_server(config: Config) -> eyre::Result<()> {
    let home = finger_home();
    std::fs::create_dir_all(&home)?;
    info!(home = %home.display(), port = config.daemon.http_port, "daemon runtime starting");

    let bus = EventBus::with_default_capacity();
    if config.daemon.persist_events {
        bus.enable_persistence(event_logs_dir(&home));
    }

    let mailbox = Arc::new(Mailbox::new());
    let pool = Arc::new(Mutex::new(crate::pool::ResourcePool::open(pool_path(&home))?));
    let checkpoints = Arc::new(CheckpointStore::new(checkpoints_dir(&home)));
    let tracker: Arc<dyn Tracker> = Arc::new(MemoryTracker::new());
    let sessions = Arc::new(Mutex::new(SessionManager::load(&home)?.with_compress_threshold(
        config.compression.message_threshold,
    )));
    let loops = Arc::new(Mutex::new(LoopManager::new(
        bus.clone(),
        pool.clone(),
        CompressionConfig {
            preserved_cycles: config.compression.preserved_cycles,
            max_tokens: config.compression.max_tokens,
            threshold_tokens: config.compression.threshold_tokens,
        },
    )));

    // Kernel notices feed straight onto the bus.
    let notice_bus = bus.clone();
    let bridge = Arc::new(
        KernelBridge::new(BridgeConfig {
            timeout_ms: config.kernel.timeout_ms,
            timeout_retry_count: config.kernel.timeout_retry_count,
            test_mode: false,
        })
        .with_notice_sink(Arc::new(move |notice| {
            notice_bus.emit(Event::new(notice.kind.clone(), notice.session_id.clone(), notice.payload));
        })),
    );

    let router: Arc<dyn AgentRouter> = Arc::new(DaemonRouter {
        config: config.clone(),
        home: home.clone(),
        bus: bus.clone(),
        pool,
        tracker,
        checkpoints,
        bridge,
        loops,
        sessions,
    });

    // Heartbeat broadcaster.
    let heartbeat_bus = bus.clone();
    let heartbeat_secs = config.daemon.heartbeat_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(heartbeat_secs));
        loop {
            interval.tick().await;
            heartbeat_bus.emit(Event::new("daemon.heartbeat", "", json!({"pid": std::process::id()})));
        }
    });

    // Own the PID file once the runtime is actually up.
    let supervisor = DaemonSupervisor::new(&home, config.daemon.http_port, config.daemon.startup_delay_ms);
    if let Err(e) = supervisor.register_self() {
        warn!(error = %e, "could not record daemon pid");
    }

    let state = AppState::new(bus, mailbox, router);
    let addr = format!("127.0.0.1:{}", config.daemon.http_port);
    crate::server::serve(&addr, state).await?;
    Ok(())
}
