//! HTTP message hub + WebSocket event stream (axum)
//!
//! The HTTP surface is intentionally small: message submission and
//! polling, module registration for autostart, and the `/ws` upgrade.
//! Everything else flows through the event stream.

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::events::EventBus;
use crate::mailbox::Mailbox;

pub use http::{AgentRouter, MessageRequest, MessageResponse, ModuleRegistration};

/// Shared server state
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub mailbox: Arc<Mailbox>,
    pub router: Arc<dyn AgentRouter>,
    /// Modules registered through the autostart endpoint
    pub modules: std::sync::Mutex<Vec<ModuleRegistration>>,
}

impl AppState {
    pub fn new(bus: Arc<EventBus>, mailbox: Arc<Mailbox>, router: Arc<dyn AgentRouter>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            mailbox,
            router,
            modules: std::sync::Mutex::new(Vec::new()),
        })
    }
}

/// Build the router for the daemon's HTTP/WS surface
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/message", post(http::submit_message))
        .route("/api/v1/message/:id", get(http::get_message))
        .route("/api/v1/message/callback/:callback_id", get(http::get_message_by_callback))
        .route("/api/v1/modules/register", post(http::register_module))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve on an existing listener (tests bind to port 0 and pass it in)
pub async fn serve_on_listener(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("message hub listening on http://{}", addr);
    axum::serve(listener, router(state)).await
}

/// Bind and serve
pub async fn serve(addr: &str, state: Arc<AppState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on_listener(listener, state).await
}
