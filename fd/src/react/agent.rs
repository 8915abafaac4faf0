//! Agent and Reviewer traits, plus the kernel-backed agent

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::kernel::{KernelBridge, KernelError, TurnOptions, TurnResponse};

use super::decision::Decision;

/// The text-in/text-out face of a worker the ReAct loop drives.
///
/// One agent maps to one kernel session; `reset` disconnects and
/// reinitializes it (the fresh-session-per-round policy).
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Produce the response for one round prompt
    async fn generate(&self, prompt: &str) -> Result<String, KernelError>;

    /// Drop the underlying session so the next round starts clean
    async fn reset(&self);
}

/// A reviewer's verdict on a proposed decision
#[derive(Debug, Clone)]
pub struct Verdict {
    pub approved: bool,
    pub reason: String,
}

impl Verdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Optional secondary agent that may veto a proposed action
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, decision: &Decision) -> Verdict;
}

/// An [`Agent`] backed by a kernel session through the bridge
pub struct KernelAgent {
    agent_id: String,
    session_id: String,
    provider_id: String,
    binary: PathBuf,
    bridge: Arc<KernelBridge>,
    options: TurnOptions,
}

impl KernelAgent {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        provider_id: impl Into<String>,
        binary: impl Into<PathBuf>,
        bridge: Arc<KernelBridge>,
    ) -> Self {
        let session_id = session_id.into();
        let options = TurnOptions::for_session(&session_id);
        Self {
            agent_id: agent_id.into(),
            session_id,
            provider_id: provider_id.into(),
            binary: binary.into(),
            bridge,
            options,
        }
    }

    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Agent for KernelAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    async fn generate(&self, prompt: &str) -> Result<String, KernelError> {
        debug!(agent_id = %self.agent_id, prompt_len = prompt.len(), "KernelAgent::generate");
        let response = self
            .bridge
            .run_turn(
                &self.session_id,
                &self.binary,
                &self.provider_id,
                prompt,
                Some(self.options.clone()),
            )
            .await?;
        match response {
            TurnResponse::Completed(turn) => Ok(turn.last_agent_message),
            TurnResponse::PendingQueued { id } => Err(KernelError::Protocol(format!(
                "turn was queued as pending input ({}) while another turn is active",
                id
            ))),
        }
    }

    async fn reset(&self) {
        debug!(agent_id = %self.agent_id, "KernelAgent::reset");
        self.bridge.dispose_session(&self.session_id, &self.provider_id).await;
    }
}
