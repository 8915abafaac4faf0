//! Scripted agents and reviewers for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::kernel::KernelError;

use super::agent::{Agent, Reviewer, Verdict};
use super::decision::Decision;

/// An agent that replays a fixed list of responses
pub struct ScriptedAgent {
    agent_id: String,
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    resets: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(agent_id: impl Into<String>, responses: Vec<&str>) -> Self {
        Self {
            agent_id: agent_id.into(),
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        }
    }

    /// How many generate calls were made
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The prompts seen so far, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times the session was reset
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.agent_id
    }

    async fn generate(&self, prompt: &str) -> Result<String, KernelError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| KernelError::Protocol("scripted agent ran out of responses".to_string()))
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// A reviewer with a fixed policy
pub struct ScriptedReviewer {
    reject_reason: Option<String>,
    /// Action names to reject; empty means apply the policy to all
    reject_actions: Vec<String>,
}

impl ScriptedReviewer {
    pub fn approve_all() -> Self {
        Self {
            reject_reason: None,
            reject_actions: Vec::new(),
        }
    }

    pub fn reject_all(reason: impl Into<String>) -> Self {
        Self {
            reject_reason: Some(reason.into()),
            reject_actions: Vec::new(),
        }
    }

    pub fn reject_action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reject_reason: Some(reason.into()),
            reject_actions: vec![action.into()],
        }
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(&self, decision: &Decision) -> Verdict {
        match &self.reject_reason {
            None => Verdict::approve(),
            Some(reason) => {
                if self.reject_actions.is_empty() || self.reject_actions.contains(&decision.action) {
                    Verdict::reject(reason.clone())
                } else {
                    Verdict::approve()
                }
            }
        }
    }
}
