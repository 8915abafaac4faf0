//! ReAct loop runtime: structured decisions, format repair, stop
//! conditions, and per-round snapshots.

mod agent;
mod decision;
mod engine;
mod snapshot;
pub mod testing;

pub use agent::{Agent, KernelAgent, Reviewer, Verdict};
pub use decision::{DECISION_SHAPE, Decision, DecisionError, parse_decision};
pub use engine::{FormatFix, ReActIteration, ReactConfig, ReactLoop, ReactOutcome, ReactStatus, StopConditions};
pub use snapshot::{JsonlSnapshotLogger, MemorySnapshots, RoundSnapshot, SnapshotKind, SnapshotSink, excerpt};
