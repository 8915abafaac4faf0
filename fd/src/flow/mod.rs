//! Hierarchical loop/node model: epic flows, loop lifecycle, and
//! context-window compression.

mod manager;
mod types;

pub use manager::{CompressionConfig, FlowError, LoopManager};
pub use types::{
    CompressedContext, ContextWindow, EpicTaskFlow, Loop, LoopNode, LoopPhase, LoopResult, LoopStatus, NodeDraft,
    NodeStatus, NodeType, PendingInput,
};
