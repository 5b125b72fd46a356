//! In-memory bus fakes for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::{BusDelivery, EventPublisher};

/// Publisher that records messages, optionally failing or hanging first.
#[derive(Default)]
pub struct FlakyPublisher {
    pub attempts: AtomicU32,
    failures_left: AtomicU32,
    hang: bool,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl FlakyPublisher {
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Fails the first `n` publishes.
    pub fn failing(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Never completes a publish.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FlakyPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("broker unavailable");
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Delivery that counts commits.
pub struct TestDelivery {
    topic: String,
    payload: Bytes,
    fail_commit: bool,
    pub commits: Arc<AtomicUsize>,
}

impl TestDelivery {
    pub fn new(topic: &str, payload: &str) -> Self {
        Self {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            fail_commit: false,
            commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_commit(topic: &str, payload: &str) -> Self {
        Self {
            fail_commit: true,
            ..Self::new(topic, payload)
        }
    }
}

#[async_trait]
impl BusDelivery for TestDelivery {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit {
            anyhow::bail!("coordinator unavailable");
        }
        Ok(())
    }
}
