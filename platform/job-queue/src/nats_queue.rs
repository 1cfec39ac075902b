//! NATS-based implementation of the JobQueue trait

use crate::{JobQueue, QueueError, QueueResult, QueuedJob};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

/// Production JobQueue over a NATS connection.
///
/// Wraps an already-connected `async_nats::Client`; subject-pattern
/// semantics are NATS-native, so `consume` maps directly onto a NATS
/// subscription.
#[derive(Clone)]
pub struct NatsQueue {
    client: Client,
}

impl NatsQueue {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Direct access to the underlying client for features not exposed
    /// through the trait (stream management, KV).
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn enqueue(&self, subject: &str, payload: Vec<u8>) -> QueueResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| QueueError::Enqueue(e.to_string()))
    }

    async fn consume(&self, pattern: &str) -> QueueResult<BoxStream<'static, QueuedJob>> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        let stream = subscriber
            .map(|msg| QueuedJob::new(msg.subject.to_string(), msg.payload.to_vec()));

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    // Requires a running NATS server; run manually with
    // docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_enqueue_consume() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let queue = NatsQueue::new(client);
        let mut stream = queue.consume("test.jobs.>").await.unwrap();

        queue
            .enqueue("test.jobs.write", b"payload".to_vec())
            .await
            .unwrap();

        let job = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for job")
            .expect("stream ended");

        assert_eq!(job.subject, "test.jobs.write");
        assert_eq!(job.payload, b"payload");
    }
}
