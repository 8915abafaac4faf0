//! Mailbox - async request registry
//!
//! Inbound requests are recorded here before being dispatched to a target
//! agent. Each entry carries a callback identifier the caller can poll,
//! and a status that only ever moves forward:
//! `pending -> processing -> completed | failed`.

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many entries are retained per target agent; oldest terminal
/// entries are evicted first once the limit is hit.
pub const RETENTION_PER_TARGET: usize = 100;

/// Callback identifiers follow `cli-<unixMillis>-<6 lowercase alnum>`
pub fn callback_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^cli-\d+-[a-z0-9]{6}$").unwrap_or_else(|_| unreachable!()))
}

/// Generate a fresh callback identifier
pub fn generate_callback_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect();
    format!("cli-{}-{}", millis, suffix)
}

/// Entry lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MailboxStatus {
    /// Position on the monotonic chain; terminal states share a rank
    fn rank(&self) -> u8 {
        match self {
            MailboxStatus::Pending => 0,
            MailboxStatus::Processing => 1,
            MailboxStatus::Completed | MailboxStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MailboxStatus::Completed | MailboxStatus::Failed)
    }
}

/// One recorded request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxEntry {
    /// Identity `msg-...`
    pub id: String,
    /// Target agent identifier
    pub target: String,
    /// Original request payload
    pub message: Value,
    /// Sender identifier
    pub sender: String,
    /// Externally pollable callback identifier
    pub callback_id: String,
    pub status: MailboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("invalid callback id '{0}' (expected cli-<millis>-<6 alnum>)")]
    InvalidCallbackId(String),

    #[error("duplicate callback id '{0}'")]
    DuplicateCallbackId(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("status downgrade {from:?} -> {to:?} on message {id}")]
    StatusDowngrade {
        id: String,
        from: MailboxStatus,
        to: MailboxStatus,
    },
}

struct Inner {
    entries: HashMap<String, MailboxEntry>,
    /// callback id -> message id, for O(1) callback lookup
    by_callback: HashMap<String, String>,
    /// per-target insertion order, for retention
    by_target: HashMap<String, VecDeque<String>>,
}

/// The mailbox. Mutations are serialized by an internal lock.
pub struct Mailbox {
    inner: Mutex<Inner>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_callback: HashMap::new(),
                by_target: HashMap::new(),
            }),
        }
    }

    /// Record a new request for `target`. When `callback_id` is `None` one
    /// is generated; a supplied one must match the callback pattern and be
    /// unused. Returns the new message identity.
    pub fn create_message(
        &self,
        target: impl Into<String>,
        message: Value,
        sender: impl Into<String>,
        callback_id: Option<String>,
    ) -> Result<String, MailboxError> {
        let target = target.into();
        let callback_id = match callback_id {
            Some(cb) => {
                if !callback_id_pattern().is_match(&cb) {
                    return Err(MailboxError::InvalidCallbackId(cb));
                }
                cb
            }
            None => generate_callback_id(),
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.by_callback.contains_key(&callback_id) {
            return Err(MailboxError::DuplicateCallbackId(callback_id));
        }

        let now = Utc::now();
        let id = format!("msg-{}", Uuid::now_v7());
        let entry = MailboxEntry {
            id: id.clone(),
            target: target.clone(),
            message,
            sender: sender.into(),
            callback_id: callback_id.clone(),
            status: MailboxStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        debug!(message_id = %id, %target, %callback_id, "Mailbox::create_message");
        inner.by_callback.insert(callback_id, id.clone());
        inner.entries.insert(id.clone(), entry);
        inner.by_target.entry(target.clone()).or_default().push_back(id.clone());

        Self::evict_for_target(&mut inner, &target);
        Ok(id)
    }

    /// Advance an entry's status. Downgrades and terminal-to-terminal
    /// moves are programmer errors and are rejected.
    pub fn update_status(
        &self,
        message_id: &str,
        status: MailboxStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), MailboxError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get_mut(message_id)
            .ok_or_else(|| MailboxError::NotFound(message_id.to_string()))?;

        let downgrade = status.rank() < entry.status.rank();
        let terminal_flip = entry.status.is_terminal() && status != entry.status;
        if downgrade || terminal_flip {
            warn!(message_id, from = ?entry.status, to = ?status, "Mailbox: rejected status transition");
            return Err(MailboxError::StatusDowngrade {
                id: message_id.to_string(),
                from: entry.status,
                to: status,
            });
        }

        debug!(message_id, from = ?entry.status, to = ?status, "Mailbox::update_status");
        entry.status = status;
        entry.updated_at = Utc::now();
        if result.is_some() {
            entry.result = result;
        }
        if error.is_some() {
            entry.error = error;
        }
        Ok(())
    }

    /// Snapshot an entry by message identity
    pub fn get_message(&self, message_id: &str) -> Option<MailboxEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(message_id).cloned()
    }

    /// Snapshot an entry by callback identity (O(1))
    pub fn get_message_by_callback_id(&self, callback_id: &str) -> Option<MailboxEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.by_callback.get(callback_id)?;
        inner.entries.get(id).cloned()
    }

    /// All entries for a target, oldest first
    pub fn messages_for_target(&self, target: &str) -> Vec<MailboxEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .by_target
            .get(target)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_for_target(inner: &mut Inner, target: &str) {
        let Some(order) = inner.by_target.get_mut(target) else {
            return;
        };
        while order.len() > RETENTION_PER_TARGET {
            // Evict the oldest terminal entry; if none is terminal yet,
            // retention waits rather than dropping live requests.
            let victim = order
                .iter()
                .position(|id| inner.entries.get(id).is_some_and(|e| e.status.is_terminal()));
            match victim {
                Some(pos) => {
                    if let Some(id) = order.remove(pos)
                        && let Some(entry) = inner.entries.remove(&id)
                    {
                        inner.by_callback.remove(&entry.callback_id);
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_then_lookup_by_callback() {
        let mailbox = Mailbox::new();
        let id = mailbox
            .create_message("orchestrator", json!({"type": "ORCHESTRATE"}), "cli", None)
            .unwrap();

        let entry = mailbox.get_message(&id).unwrap();
        assert!(entry.id.starts_with("msg-"));
        assert_eq!(entry.status, MailboxStatus::Pending);
        assert!(callback_id_pattern().is_match(&entry.callback_id));

        let by_cb = mailbox.get_message_by_callback_id(&entry.callback_id).unwrap();
        assert_eq!(by_cb.id, id);
        assert_eq!(by_cb.callback_id, entry.callback_id);
    }

    #[test]
    fn test_supplied_callback_id_validated() {
        let mailbox = Mailbox::new();
        let err = mailbox
            .create_message("a", json!({}), "cli", Some("not-a-callback".to_string()))
            .unwrap_err();
        assert!(matches!(err, MailboxError::InvalidCallbackId(_)));

        let ok = mailbox.create_message("a", json!({}), "cli", Some("cli-1712345678901-abc123".to_string()));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_duplicate_callback_rejected() {
        let mailbox = Mailbox::new();
        let cb = "cli-1712345678901-xyz789".to_string();
        mailbox.create_message("a", json!({}), "cli", Some(cb.clone())).unwrap();

        let err = mailbox.create_message("b", json!({}), "cli", Some(cb)).unwrap_err();
        assert!(matches!(err, MailboxError::DuplicateCallbackId(_)));
    }

    #[test]
    fn test_status_chain_forward_only() {
        let mailbox = Mailbox::new();
        let id = mailbox.create_message("a", json!({}), "cli", None).unwrap();

        mailbox.update_status(&id, MailboxStatus::Processing, None, None).unwrap();
        mailbox
            .update_status(&id, MailboxStatus::Completed, Some(json!({"ok": true})), None)
            .unwrap();

        // Downgrades and terminal flips are rejected.
        assert!(mailbox.update_status(&id, MailboxStatus::Pending, None, None).is_err());
        assert!(mailbox.update_status(&id, MailboxStatus::Processing, None, None).is_err());
        assert!(mailbox.update_status(&id, MailboxStatus::Failed, None, None).is_err());

        let entry = mailbox.get_message(&id).unwrap();
        assert_eq!(entry.status, MailboxStatus::Completed);
        assert_eq!(entry.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_terminal_same_status_is_accepted() {
        let mailbox = Mailbox::new();
        let id = mailbox.create_message("a", json!({}), "cli", None).unwrap();
        mailbox
            .update_status(&id, MailboxStatus::Failed, None, Some("boom".to_string()))
            .unwrap();
        // Re-asserting the same terminal state (e.g. enriching the error) is fine.
        mailbox
            .update_status(&id, MailboxStatus::Failed, None, Some("boom: detail".to_string()))
            .unwrap();
        assert_eq!(
            mailbox.get_message(&id).unwrap().error.as_deref(),
            Some("boom: detail")
        );
    }

    #[test]
    fn test_update_missing_message() {
        let mailbox = Mailbox::new();
        assert!(matches!(
            mailbox.update_status("msg-missing", MailboxStatus::Processing, None, None),
            Err(MailboxError::NotFound(_))
        ));
    }

    #[test]
    fn test_retention_evicts_oldest_terminal_first() {
        let mailbox = Mailbox::new();
        let mut first_id = None;
        for i in 0..(RETENTION_PER_TARGET + 5) {
            let id = mailbox.create_message("agent", json!({"i": i}), "cli", None).unwrap();
            if i < 3 {
                mailbox.update_status(&id, MailboxStatus::Completed, None, None).unwrap();
            }
            if i == 0 {
                first_id = Some(id);
            }
        }

        // The three terminal entries were evicted to make room; live
        // entries stay even beyond the limit.
        assert!(mailbox.get_message(&first_id.unwrap()).is_none());
        assert_eq!(mailbox.messages_for_target("agent").len(), RETENTION_PER_TARGET + 2);
    }

    #[test]
    fn test_generated_callback_matches_pattern() {
        for _ in 0..20 {
            assert!(callback_id_pattern().is_match(&generate_callback_id()));
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn status_strategy() -> impl Strategy<Value = MailboxStatus> {
            prop_oneof![
                Just(MailboxStatus::Pending),
                Just(MailboxStatus::Processing),
                Just(MailboxStatus::Completed),
                Just(MailboxStatus::Failed),
            ]
        }

        proptest! {
            /// Whatever sequence of updates is attempted, the observed
            /// status ranks never decrease and a terminal state never
            /// flips to the other terminal state.
            #[test]
            fn observed_statuses_are_monotonic(updates in proptest::collection::vec(status_strategy(), 1..20)) {
                let mailbox = Mailbox::new();
                let id = mailbox.create_message("t", json!({}), "cli", None).unwrap();

                let mut observed = vec![mailbox.get_message(&id).unwrap().status];
                for status in updates {
                    let _ = mailbox.update_status(&id, status, None, None);
                    observed.push(mailbox.get_message(&id).unwrap().status);
                }

                for pair in observed.windows(2) {
                    prop_assert!(pair[1].rank() >= pair[0].rank());
                    if pair[0].is_terminal() {
                        prop_assert_eq!(pair[0], pair[1]);
                    }
                }
            }
        }
    }
}
