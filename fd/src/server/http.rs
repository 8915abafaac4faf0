//! Message hub endpoints
//!
//! `POST /api/v1/message` records a MailboxEntry and dispatches to the
//! target agent's handler in the background; callers poll the entry by
//! message or callback identity. Module registration backs the
//! supervisor's autostart pass.

use async_trait::async_trait;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::mailbox::{MailboxEntry, MailboxStatus};

use super::AppState;

/// Routes a mailbox message to its target agent's handler
#[async_trait]
pub trait AgentRouter: Send + Sync {
    /// Handle one message for `target`; the returned value (or error
    /// string) lands on the mailbox entry.
    async fn handle(&self, target: &str, message: Value) -> Result<Value, String>;
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub target: String,
    pub message: Value,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default, rename = "callbackId")]
    pub callback_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub status: MailboxStatus,
    #[serde(rename = "callbackId")]
    pub callback_id: String,
}

/// POST /api/v1/message
pub async fn submit_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    debug!(target = %request.target, "submit_message");
    let message_id = state
        .mailbox
        .create_message(
            &request.target,
            request.message.clone(),
            request.sender.clone().unwrap_or_else(|| "anonymous".to_string()),
            request.callback_id,
        )
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let entry = state
        .mailbox
        .get_message(&message_id)
        .ok_or_else(|| (StatusCode::INTERNAL_SERVER_ERROR, "entry vanished".to_string()))?;

    // Dispatch off the request path; the caller polls by callback id.
    let dispatch_state = state.clone();
    let dispatch_id = message_id.clone();
    let target = request.target.clone();
    let message = request.message;
    tokio::spawn(async move {
        let _ = dispatch_state
            .mailbox
            .update_status(&dispatch_id, MailboxStatus::Processing, None, None);

        match dispatch_state.router.handle(&target, message).await {
            Ok(result) => {
                let _ = dispatch_state
                    .mailbox
                    .update_status(&dispatch_id, MailboxStatus::Completed, Some(result), None);
            }
            Err(error) => {
                warn!(message_id = %dispatch_id, %error, "agent handler failed");
                let _ = dispatch_state
                    .mailbox
                    .update_status(&dispatch_id, MailboxStatus::Failed, None, Some(error));
            }
        }
    });

    Ok(Json(MessageResponse {
        message_id,
        status: entry.status,
        callback_id: entry.callback_id,
    }))
}

/// GET /api/v1/message/:id
pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MailboxEntry>, StatusCode> {
    state.mailbox.get_message(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/v1/message/callback/:callback_id
pub async fn get_message_by_callback(
    State(state): State<Arc<AppState>>,
    Path(callback_id): Path<String>,
) -> Result<Json<MailboxEntry>, StatusCode> {
    state
        .mailbox
        .get_message_by_callback_id(&callback_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// A module manifest or script registered for autostart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRegistration {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub kind: String,
}

/// POST /api/v1/modules/register
pub async fn register_module(
    State(state): State<Arc<AppState>>,
    Json(module): Json<ModuleRegistration>,
) -> Json<Value> {
    info!(name = %module.name, path = %module.path, "module registered");
    let mut modules = state.modules.lock().unwrap_or_else(|e| e.into_inner());
    modules.retain(|m| m.name != module.name);
    modules.push(module);
    Json(serde_json::json!({"ok": true, "count": modules.len()}))
}
