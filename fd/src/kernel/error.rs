//! Kernel bridge error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the kernel bridge on a turn.
///
/// Retry policy hangs off [`KernelError::is_retryable`]: timeouts and
/// transient failures retry with backoff; authentication and quota
/// failures surface immediately; a dead child is fatal and the caller
/// decides whether to respawn.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient kernel error{}: {message}", status.map(|s| format!(" (status {})", s)).unwrap_or_default())]
    Transient { status: Option<u16>, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("kernel process died (code {code:?}, signal {signal:?}): {stderr}")]
    Fatal {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("malformed kernel output: {0}")]
    Malformed(String),

    #[error("turn interrupted: {0}")]
    Interrupted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP status codes the bridge treats as retryable
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429 | 500 | 502 | 503 | 504)
}

/// Map a kernel-reported error (message + optional status) to a variant
pub fn classify_kernel_error(message: &str, status: Option<u16>) -> KernelError {
    match status {
        Some(s @ (401 | 402 | 403)) => KernelError::Unauthorized(format!("status {}: {}", s, message)),
        Some(429) if message.to_lowercase().contains("quota") => KernelError::QuotaExhausted(message.to_string()),
        Some(s) if is_retryable_status(s) => KernelError::Transient {
            status: Some(s),
            message: message.to_string(),
        },
        Some(s) => KernelError::Protocol(format!("status {}: {}", s, message)),
        None => {
            let lower = message.to_lowercase();
            if lower.contains("quota") {
                KernelError::QuotaExhausted(message.to_string())
            } else if lower.contains("connection") || lower.contains("network") || lower.contains("reset") {
                KernelError::Transient {
                    status: None,
                    message: message.to_string(),
                }
            } else {
                KernelError::Protocol(message.to_string())
            }
        }
    }
}

impl KernelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KernelError::Timeout(_) => true,
            KernelError::Transient { .. } => true,
            KernelError::Io(_) => true,
            KernelError::Unauthorized(_)
            | KernelError::QuotaExhausted(_)
            | KernelError::Fatal { .. }
            | KernelError::Malformed(_)
            | KernelError::Interrupted(_)
            | KernelError::Protocol(_)
            | KernelError::Json(_) => false,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, KernelError::Interrupted(_))
    }
}
