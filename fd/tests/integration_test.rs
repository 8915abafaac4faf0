//! Integration tests for the finger daemon
//!
//! These exercise end-to-end flows across components: orchestrator +
//! executor + pool + bus for a full plan/dispatch/verify pass, and the
//! kernel bridge driven by scripted stand-in kernels.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use fingerd::actions::ActionContext;
use fingerd::events::EventBus;
use fingerd::executor::{ExecutorConfig, ExecutorLoop};
use fingerd::kernel::{BridgeConfig, KernelBridge, KernelError};
use fingerd::orchestrator::{
    DispatchOutcome, Orchestrator, OrchestratorConfig, Phase, TaskDispatcher, TaskNode,
};
use fingerd::pool::{Capability, Resource, ResourcePool, ResourceType};
use fingerd::react::{KernelAgent, testing::ScriptedAgent};
use fingerd::tracker::MemoryTracker;

// =============================================================================
// Helpers
// =============================================================================

fn executor_pool(count: usize, capability: &str) -> Arc<Mutex<ResourcePool>> {
    let mut pool = ResourcePool::in_memory();
    for i in 0..count {
        pool.add_resource(Resource::new(
            format!("exec-{}", i),
            ResourceType::Executor,
            vec![Capability::new(capability, 10)],
        ))
        .unwrap();
    }
    Arc::new(Mutex::new(pool))
}

/// Dispatcher that runs each task through a real ExecutorLoop with a
/// scripted agent writing the file the description names.
struct ScriptedExecutorDispatcher {
    tracker: Arc<MemoryTracker>,
    bus: Arc<EventBus>,
    workdir: PathBuf,
}

#[async_trait]
impl TaskDispatcher for ScriptedExecutorDispatcher {
    async fn dispatch(&self, session_id: &str, workflow_id: &str, task: &TaskNode) -> DispatchOutcome {
        // "create file X" -> writes X.txt then completes.
        let file = task.description.split_whitespace().last().unwrap_or("out").to_string();
        let write_decision = format!(
            r#"{{"thought": "write it", "action": "WRITE_FILE", "params": {{"path": "{}.txt", "content": "made by {}"}}}}"#,
            file, task.id
        );
        let complete_decision = format!(r#"{{"action": "COMPLETE", "params": {{"summary": "{} written"}}}}"#, file);
        let agent = Arc::new(ScriptedAgent::new(
            format!("exec-agent-{}", task.id),
            vec![write_decision.as_str(), complete_decision.as_str()],
        ));
        let executor = ExecutorLoop::new(
            agent,
            self.tracker.clone(),
            self.bus.clone(),
            ExecutorConfig {
                max_iterations: 5,
                fresh_session_per_round: false,
            },
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
        DispatchOutcome {
            success: outcome.success,
            observation: outcome.observation,
            error: outcome.error,
        }
    }
}

fn script_kernel(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("kernel.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// =============================================================================
// Happy path: plan -> dispatch -> verify (with a real executor loop)
// =============================================================================

#[tokio::test]
async fn test_plan_dispatch_verify_end_to_end() {
    let temp = TempDir::new().unwrap();
    let bus = EventBus::with_default_capacity();
    let tracker = Arc::new(MemoryTracker::new());
    let checkpoints = Arc::new(sessionstore::CheckpointStore::new(temp.path().join("checkpoints")));

    let dispatcher = Arc::new(ScriptedExecutorDispatcher {
        tracker: tracker.clone(),
        bus: bus.clone(),
        workdir: temp.path().to_path_buf(),
    });

    let orchestrator = Orchestrator::new(
        "sess-e2e",
        "wf-e2e",
        "build file X and file Y",
        executor_pool(2, "file_ops"),
        tracker.clone(),
        bus.clone(),
        checkpoints,
        dispatcher,
        OrchestratorConfig::default(),
    );

    let registry = orchestrator.build_registry();
    let ctx = ActionContext::new("sess-e2e", temp.path());

    let plan = registry
        .execute(
            "PLAN",
            json!({"tasks": [
                {"id": "task-1", "description": "create file X"},
                {"id": "task-2", "description": "create file Y"}
            ]}),
            &ctx,
        )
        .await;
    assert!(plan.success, "{:?}", plan.error);

    let dispatch = registry.execute("PARALLEL_DISPATCH", json!({}), &ctx).await;
    assert!(dispatch.success, "{:?}", dispatch.error);
    assert_eq!(dispatch.data.as_ref().unwrap()["completed"], 2);
    assert_eq!(dispatch.data.as_ref().unwrap()["failed"], 0);

    // The executors actually wrote the files.
    assert!(temp.path().join("X.txt").exists());
    assert!(temp.path().join("Y.txt").exists());

    let verify = registry.execute("VERIFY", json!({}), &ctx).await;
    assert!(verify.success);
    assert_eq!(orchestrator.phase().await, Phase::Completed);

    // One start and one completion per task on the stream.
    let types: Vec<String> = bus.get_history(None).into_iter().map(|e| e.event_type).collect();
    assert_eq!(types.iter().filter(|t| *t == "task_started").count(), 2);
    assert_eq!(types.iter().filter(|t| *t == "task_completed").count(), 2);
    let progress = bus.get_history_by_type("workflow_progress", None);
    assert_eq!(progress.last().unwrap().payload["percent"], 100.0);
}

// =============================================================================
// Kernel bridge: executor backed by a scripted kernel binary
// =============================================================================

#[tokio::test]
async fn test_executor_with_kernel_agent_completes() {
    let temp = TempDir::new().unwrap();
    // A kernel that always answers with a COMPLETE decision.
    let binary = script_kernel(
        temp.path(),
        r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"shutdown"'*)
      printf '{"id":"%s","msg":{"type":"shutdown_complete"}}\n' "$id"
      exit 0
      ;;
    *)
      cat << KEOF
{"id":"$id","msg":{"type":"task_complete","last_agent_message":"{\"action\": \"COMPLETE\", \"params\": {\"summary\": \"kernel did it\"}}"}}
KEOF
      ;;
  esac
done"#,
    );

    let bridge = Arc::new(KernelBridge::new(BridgeConfig {
        timeout_ms: 5_000,
        timeout_retry_count: 0,
        test_mode: true,
    }));
    let agent = Arc::new(KernelAgent::new("exec-k", "sess-k", "prov", &binary, bridge));

    let bus = EventBus::with_default_capacity();
    let tracker = Arc::new(MemoryTracker::new());
    let executor = ExecutorLoop::new(
        agent,
        tracker,
        bus.clone(),
        ExecutorConfig {
            max_iterations: 3,
            fresh_session_per_round: false,
        },
        temp.path(),
    );

    let outcome = executor
        .execute_task("sess-k", None, "task-k", "finish trivially", None)
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert!(outcome.observation.contains("kernel did it"));
    assert_eq!(bus.get_history_by_type("task_completed", None).len(), 1);
}

#[tokio::test]
async fn test_user_interrupt_fails_task_with_interrupted_error() {
    let temp = TempDir::new().unwrap();
    // A kernel that reads input but never responds.
    let binary = script_kernel(temp.path(), "cat > /dev/null");

    let bridge = Arc::new(KernelBridge::new(BridgeConfig {
        timeout_ms: 30_000,
        timeout_retry_count: 0,
        test_mode: true,
    }));
    let agent = Arc::new(KernelAgent::new(
        "exec-i",
        "sess-i",
        "prov",
        &binary,
        bridge.clone(),
    ));

    let bus = EventBus::with_default_capacity();
    let tracker = Arc::new(MemoryTracker::new());
    let executor = ExecutorLoop::new(
        agent,
        tracker,
        bus.clone(),
        ExecutorConfig {
            max_iterations: 3,
            fresh_session_per_round: false,
        },
        temp.path(),
    );

    let task = tokio::spawn(async move {
        executor
            .execute_task("sess-i", None, "task-i", "never finishes", None)
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    bridge.interrupt_session("sess-i", None).await;

    let outcome = task.await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("interrupted"));

    let failed = bus.get_history_by_type("task_failed", None);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].agent_id.as_deref(), Some("exec-i"));
}

// =============================================================================
// Format repair against a prose-then-JSON kernel
// =============================================================================

#[tokio::test]
async fn test_format_repair_against_kernel() {
    let temp = TempDir::new().unwrap();
    // First turn answers prose; later turns answer valid JSON. A state
    // file distinguishes the calls because each turn spawns a fresh child.
    let marker = temp.path().join("seen-once");
    let binary = script_kernel(
        temp.path(),
        &format!(
            r#"MARKER="{}"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"shutdown"'*)
      printf '{{"id":"%s","msg":{{"type":"shutdown_complete"}}}}\n' "$id"
      exit 0
      ;;
    *)
      if [ -f "$MARKER" ]; then
        cat << KEOF
{{"id":"$id","msg":{{"type":"task_complete","last_agent_message":"{{\"action\": \"COMPLETE\", \"params\": {{\"summary\": \"fixed\"}}}}"}}}}
KEOF
      else
        touch "$MARKER"
        printf '{{"id":"%s","msg":{{"type":"task_complete","last_agent_message":"Sure, I will: WRITE_FILE path=x.txt"}}}}\n' "$id"
      fi
      ;;
  esac
done"#,
            marker.display()
        ),
    );

    let bridge = Arc::new(KernelBridge::new(BridgeConfig {
        timeout_ms: 5_000,
        timeout_retry_count: 0,
        test_mode: true,
    }));
    let agent = Arc::new(KernelAgent::new("exec-r", "sess-r", "prov", &binary, bridge));

    let snapshots = Arc::new(fingerd::react::MemorySnapshots::new());
    let react = fingerd::react::ReactLoop::new(
        agent,
        Arc::new(fingerd::actions::standard_registry()),
        fingerd::react::ReactConfig::default(),
    )
    .with_snapshots(snapshots.clone());

    let ctx = ActionContext::new("sess-r", temp.path());
    let outcome = react.run("finish up", &ctx).await.unwrap();
    assert_eq!(outcome.status, fingerd::react::ReactStatus::Complete);
    assert_eq!(outcome.rounds, 1, "repaired within the first round");

    let entries = snapshots.entries();
    assert_eq!(
        entries
            .iter()
            .filter(|s| s.kind == fingerd::react::SnapshotKind::FormatRepair)
            .count(),
        1
    );
}

// =============================================================================
// Mailbox round-trip law
// =============================================================================

#[tokio::test]
async fn test_mailbox_create_then_lookup_roundtrip() {
    let mailbox = fingerd::Mailbox::new();
    let id = mailbox
        .create_message("orchestrator", json!({"type": "ORCHESTRATE", "task": "x"}), "cli", None)
        .unwrap();

    let entry = mailbox.get_message(&id).unwrap();
    let by_callback = mailbox.get_message_by_callback_id(&entry.callback_id).unwrap();
    assert_eq!(by_callback.id, entry.id);
    assert_eq!(by_callback.callback_id, entry.callback_id);
}
