//! SessionStore - file-backed persistence for the Finger daemon
//!
//! Stores three record families under a single root directory
//! (`~/.finger` in production, a temp dir in tests):
//!
//! - **Sessions** - one JSON file per session, bucketed by project
//!   directory (`sessions/<bucket>/<id>.json`), with support for the
//!   legacy flat layout (`sessions/<id>.json`) on read.
//! - **Messages** - embedded in their owning session record.
//! - **Checkpoints** - append-only JSONL, one file per session
//!   (`checkpoints/<sessionId>.jsonl`). The most recent entry is the
//!   resume point; entries are never mutated after write.
//!
//! All writes are whole-file atomic (write temp, rename) so readers
//! never observe a torn record.

pub mod checkpoint;
pub mod session;
pub mod store;

pub use checkpoint::{AgentState, Checkpoint, CheckpointStore, TaskProgress};
pub use session::{Message, MessageKind, MessageRole, Session, normalize_project_dir};
pub use store::{SessionStore, StoreError, write_atomic};
