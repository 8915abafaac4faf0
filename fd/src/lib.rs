//! Finger - local multi-agent orchestration daemon
//!
//! Finger accepts a natural-language task, decomposes it into a task
//! graph, and drives the graph to completion by dispatching subtasks to
//! worker agents under a capability budget, with checkpointed progress,
//! phased replanning, and real-time event fanout.
//!
//! # Core Components
//!
//! - [`events`] - unified event bus (typed pub/sub, history, WebSocket fanout)
//! - [`mailbox`] - async request registry with callback identifiers
//! - [`pool`] - capability-based resource pool and allocation
//! - [`flow`] - loop/node model and context-window compression
//! - [`actions`] - action registry and executor primitives
//! - [`react`] - round-by-round thought/action/observation driver
//! - [`kernel`] - external LLM kernel bridge over line-delimited JSON
//! - [`orchestrator`] - phased state machine with checkpoint resume
//! - [`executor`] - per-task executor loop with tracker synchronization
//! - [`session`] - per-project session manager
//! - [`server`] - HTTP message hub + WebSocket event stream
//! - [`daemon`] - single-instance supervisor

pub mod actions;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod flow;
pub mod kernel;
pub mod mailbox;
pub mod orchestrator;
pub mod pool;
pub mod react;
pub mod runtime;
pub mod server;
pub mod session;
pub mod tracker;

// Re-export commonly used types
pub use actions::{Action, ActionContext, ActionRegistry, ActionResult, standard_registry};
pub use config::Config;
pub use events::{Event, EventBus, EventGroup};
pub use executor::{ExecutorConfig, ExecutorLoop, KernelTaskDispatcher, TaskOutcome};
pub use flow::{CompressionConfig, EpicTaskFlow, Loop, LoopManager, LoopNode, LoopPhase};
pub use kernel::{BridgeConfig, KernelBridge, KernelError, TurnOptions, TurnResponse};
pub use mailbox::{Mailbox, MailboxEntry, MailboxStatus};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Phase, TaskDispatcher, TaskGraph, TaskNode, TaskStatus};
pub use pool::{Capability, Requirement, Resource, ResourcePool, ResourceType};
pub use react::{Agent, ReactConfig, ReactLoop, ReactOutcome, ReactStatus};
pub use session::SessionManager;
pub use tracker::{MemoryTracker, Tracker};
