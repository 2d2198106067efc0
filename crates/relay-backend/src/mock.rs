use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::BackendError;

use crate::transport::{Backend, BackendReply};

/// Pre-programmed replies for deterministic testing without network calls.
pub enum MockReply {
    Reply(BackendReply),
    Fail(BackendError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// Convenience: a plain text reply with no reported token count.
    pub fn text(text: &str) -> Self {
        Self::Reply(BackendReply::text(text))
    }

    /// Convenience: a text reply with a reported token count.
    pub fn text_with_tokens(text: &str, tokens_used: u64) -> Self {
        Self::Reply(BackendReply::with_tokens(text, tokens_used))
    }

    /// Convenience: wrap any reply with a delay.
    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that consumes pre-programmed replies in sequence.
pub struct MockBackend {
    id: String,
    replies: Mutex<VecDeque<MockReply>>,
    call_count: AtomicUsize,
}

impl MockBackend {
    pub fn new(id: &str, replies: Vec<MockReply>) -> Self {
        Self {
            id: id.to_string(),
            replies: Mutex::new(replies.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Append a reply after construction. Useful for multi-phase tests.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _prompt: &str) -> Result<BackendReply, BackendError> {
        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(reply) = self.replies.lock().pop_front() else {
            return Err(BackendError::ServiceError(format!(
                "MockBackend '{}': no reply configured for call {}",
                self.id, call
            )));
        };

        // Unroll nested delays iteratively to avoid recursive async.
        let mut current = reply;
        loop {
            match current {
                MockReply::Reply(reply) => return Ok(reply),
                MockReply::Fail(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_sequence() {
        let mock = MockBackend::new(
            "m",
            vec![MockReply::text("first"), MockReply::text("second")],
        );

        let first = mock.send("p").await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(mock.call_count(), 1);

        let second = mock.send("p").await.unwrap();
        assert_eq!(second.text, "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn failure_reply() {
        let mock = MockBackend::new(
            "m",
            vec![MockReply::Fail(BackendError::RateLimited { retry_after: None })],
        );
        let err = mock.send("p").await.unwrap_err();
        assert!(matches!(err, BackendError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn exhausted_replies() {
        let mock = MockBackend::new("m", vec![MockReply::text("only one")]);
        let _ = mock.send("p").await;
        let err = mock.send("p").await.unwrap_err();
        assert!(err.to_string().contains("no reply configured"));
    }

    #[tokio::test]
    async fn delayed_reply() {
        let mock = MockBackend::new(
            "m",
            vec![MockReply::delayed(
                Duration::from_millis(50),
                MockReply::text("after delay"),
            )],
        );

        let start = std::time::Instant::now();
        let reply = mock.send("p").await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(reply.text, "after delay");
        assert!(
            elapsed >= Duration::from_millis(40),
            "delay should have waited ~50ms, got {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn push_appends_reply() {
        let mock = MockBackend::new("m", vec![]);
        mock.push(MockReply::text_with_tokens("late", 7));
        let reply = mock.send("p").await.unwrap();
        assert_eq!(reply.tokens_used, 7);
    }

    #[test]
    fn id_is_exposed() {
        let mock = MockBackend::new("alpha", vec![]);
        assert_eq!(mock.id(), "alpha");
    }
}
