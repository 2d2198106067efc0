use async_trait::async_trait;

use relay_core::BackendError;

/// Response from a single backend call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendReply {
    pub text: String,
    /// Units consumed as reported by the service. 0 when the transport
    /// does not report usage; the router then falls back to the backend's
    /// configured per-call estimate.
    pub tokens_used: u64,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_used: 0,
        }
    }

    pub fn with_tokens(text: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            text: text.into(),
            tokens_used,
        }
    }
}

/// Trait implemented by each backend transport.
///
/// Implementations report failures through the `BackendError` taxonomy so the
/// router can classify outcomes. Deadline enforcement is the router's job, not
/// the transport's.
#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, prompt: &str) -> Result<BackendReply, BackendError>;
}
