//! In-memory implementation of the JobQueue trait for testing and development

use crate::{JobQueue, QueueResult, QueuedJob};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

/// JobQueue implementation backed by a Tokio broadcast channel.
///
/// Suitable for unit tests, local development without Docker, and
/// integration tests that need a fast isolated queue. Every consumer whose
/// pattern matches sees every job; a job enqueued before any matching
/// consumer exists is dropped, so tests consume before they enqueue.
#[derive(Clone)]
pub struct InMemoryQueue {
    sender: Arc<broadcast::Sender<QueuedJob>>,
}

impl InMemoryQueue {
    /// Create a queue with the default buffer (1024 in-flight jobs).
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a queue with an explicit buffer size. Consumers that lag
    /// behind by more than `capacity` jobs lose the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// NATS-style subject match: `*` consumes one token, a trailing `>`
    /// consumes one or more remaining tokens.
    fn subject_matches(subject: &str, pattern: &str) -> bool {
        let mut subject_tokens = subject.split('.');
        let mut pattern_tokens = pattern.split('.');

        loop {
            match (subject_tokens.next(), pattern_tokens.next()) {
                (Some(_), Some(">")) => return true,
                (Some(_), Some("*")) => continue,
                (Some(s), Some(p)) if s == p => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> QueueResult<()> {
        // No receivers is not an error: dev setups may enqueue before any
        // worker is up, and broadcast reports that as a send failure.
        let _ = self.sender.send(QueuedJob::new(subject, payload));
        Ok(())
    }

    async fn consume(&self, pattern: &str) -> QueueResult<BoxStream<'static, QueuedJob>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(job) => {
                        if Self::subject_matches(&job.subject, &pattern) {
                            yield job;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "in-memory queue consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_subject_matching() {
        assert!(InMemoryQueue::subject_matches(
            "integrations.write.quickbooks",
            "integrations.write.quickbooks"
        ));
        assert!(InMemoryQueue::subject_matches(
            "integrations.write.quickbooks",
            "integrations.write.*"
        ));
        assert!(InMemoryQueue::subject_matches(
            "integrations.write.quickbooks",
            "integrations.>"
        ));
        assert!(!InMemoryQueue::subject_matches(
            "integrations.write.quickbooks",
            "integrations.*"
        ));
        assert!(!InMemoryQueue::subject_matches(
            "integrations.write.quickbooks",
            "payments.>"
        ));
        assert!(InMemoryQueue::subject_matches("single", "*"));
        assert!(InMemoryQueue::subject_matches("single", ">"));
        assert!(!InMemoryQueue::subject_matches("one.two", "one"));
    }

    #[tokio::test]
    async fn test_enqueue_and_consume() {
        let queue = InMemoryQueue::new();
        let mut stream = queue.consume("integrations.>").await.unwrap();

        queue
            .enqueue("integrations.write.quickbooks", b"job-1".to_vec())
            .await
            .unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(job.subject, "integrations.write.quickbooks");
        assert_eq!(job.payload, b"job-1");
    }

    #[tokio::test]
    async fn test_jobs_delivered_in_order() {
        let queue = InMemoryQueue::new();
        let mut stream = queue.consume("work.>").await.unwrap();

        for i in 0..4 {
            queue
                .enqueue(&format!("work.item.{i}"), vec![i])
                .await
                .unwrap();
        }

        for i in 0..4 {
            let job = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("timeout")
                .expect("stream ended");
            assert_eq!(job.subject, format!("work.item.{i}"));
            assert_eq!(job.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_pattern_filters_non_matching_subjects() {
        let queue = InMemoryQueue::new();
        let mut stream = queue.consume("integrations.write.*").await.unwrap();

        queue
            .enqueue("integrations.write.quickbooks", b"yes".to_vec())
            .await
            .unwrap();
        queue
            .enqueue("integrations.webhook.tilled", b"no".to_vec())
            .await
            .unwrap();
        queue
            .enqueue("integrations.write.xero", b"yes".to_vec())
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(first.subject, "integrations.write.quickbooks");

        let second = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(second.subject, "integrations.write.xero");

        let idle = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(idle.is_err(), "no further jobs expected");
    }

    #[tokio::test]
    async fn test_every_matching_consumer_sees_the_job() {
        let queue = InMemoryQueue::new();
        let mut a = queue.consume("work.>").await.unwrap();
        let mut b = queue.consume("work.>").await.unwrap();

        queue.enqueue("work.item", b"shared".to_vec()).await.unwrap();

        for stream in [&mut a, &mut b] {
            let job = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("timeout")
                .expect("stream ended");
            assert_eq!(job.payload, b"shared");
        }
    }
}
