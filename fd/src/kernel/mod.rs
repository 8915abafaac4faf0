//! Kernel bridge: a long-lived external LLM kernel driven over
//! line-delimited JSON, with multiplexed turns, retries, timeouts, and
//! interruption.

mod bridge;
mod error;
pub mod process;
pub mod protocol;

pub use bridge::{BridgeConfig, BridgeNotice, KernelBridge, NoticeSink, TurnResponse, TurnResult};
pub use error::{KernelError, classify_kernel_error, is_retryable_status};
pub use process::KernelProcess;
pub use protocol::{EventMsg, InputItem, KernelEvent, Op, Submission, TurnOptions};
