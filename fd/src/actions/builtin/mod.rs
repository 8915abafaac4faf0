//! Built-in executor primitives

mod list_dir;
mod read_file;
mod run_command;
mod terminal;
mod write_file;

pub use list_dir::ListDirAction;
pub use read_file::ReadFileAction;
pub use run_command::RunCommandAction;
pub use terminal::{CompleteAction, FailAction};
pub use write_file::WriteFileAction;

use std::sync::Arc;

use super::registry::ActionRegistry;

/// A registry pre-loaded with every built-in action
pub fn standard_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    // Registration of distinct fresh names cannot collide.
    let _ = registry.register(Arc::new(WriteFileAction));
    let _ = registry.register(Arc::new(ReadFileAction));
    let _ = registry.register(Arc::new(RunCommandAction));
    let _ = registry.register(Arc::new(ListDirAction));
    let _ = registry.register(Arc::new(CompleteAction));
    let _ = registry.register(Arc::new(FailAction));
    registry
}
