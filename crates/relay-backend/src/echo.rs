use std::time::Duration;

use async_trait::async_trait;

use relay_core::BackendError;

use crate::transport::{Backend, BackendReply};

/// Deterministic local transport. Answers every prompt with a digest of it,
/// reporting a length-based token count so ledger arithmetic stays realistic.
/// Used by the CLI when no real backend is wired up.
pub struct EchoBackend {
    id: String,
    latency: Duration,
}

impl EchoBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            latency: Duration::ZERO,
        }
    }

    /// Simulate work by sleeping before answering.
    pub fn with_latency(id: &str, latency: Duration) -> Self {
        Self {
            id: id.to_string(),
            latency,
        }
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, prompt: &str) -> Result<BackendReply, BackendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let excerpt: String = prompt.chars().take(120).collect();
        let text = format!("[{}] {}", self.id, excerpt);
        // Rough 4-chars-per-token estimate, never zero.
        let tokens_used = ((prompt.len() + text.len()) as u64 / 4).max(1);

        Ok(BackendReply { text, tokens_used })
    }
}
