//! Unified event bus: typed pub/sub, group subscriptions, history,
//! JSONL persistence, and WebSocket fanout.

mod bus;
mod logger;
mod types;

pub use bus::{ClientFilter, DEFAULT_MAX_HISTORY, EventBus, Subscription};
pub use logger::EventLogger;
pub use types::{Event, EventGroup};
