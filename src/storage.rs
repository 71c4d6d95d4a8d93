//! Boundaries to the blob store and the notification queue, plus in-memory backends.
//!
//! Absence is not an error: [`BlobStore::get`] reports a missing object as `Ok(None)` and
//! keeps `Err` for backend failures.

use crate::error::Result;

use alloc::collections::{BTreeMap, VecDeque};
use core::{future::Future, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

pub trait BlobStore: Send + Sync + 'static {
    fn get(&self, bucket: &str, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Whole-object replace.
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Deleting an absent object succeeds.
    fn delete(&self, bucket: &str, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Keys in `bucket` starting with `prefix`, in ascending order.
    fn list(&self, bucket: &str, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn exists(&self, bucket: &str, key: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// One received message. The receipt acknowledges this particular delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
    pub receipt: String,
}

/// An at-least-once queue: received messages become invisible for a while and reappear
/// unless acknowledged.
pub trait Queue: Send + Sync + 'static {
    /// Waits up to `wait` for at least one message, returning at most `max`.
    fn receive(&self, queue: &str, max: usize, wait: Duration) -> impl Future<Output = Result<Vec<Delivery>>> + Send;

    fn ack(&self, queue: &str, receipt: &str) -> impl Future<Output = Result<()>> + Send;

    /// Enqueues a message, visible right away.
    fn send(&self, queue: &str, body: String) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().await;
        Ok(objects.get(&(bucket.into(), key.into())).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert((bucket.into(), key.into()), bytes);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.lock().await.remove(&(bucket.into(), key.into()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().await;
        let keys = objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.objects.lock().await.contains_key(&(bucket.into(), key.into())))
    }
}

struct Pending {
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-process queue with visibility-timeout redelivery.
pub struct MemoryQueue {
    visibility: Duration,
    queues: Mutex<BTreeMap<String, VecDeque<Pending>>>,
}

impl MemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self { visibility, queues: Mutex::default() }
    }

    /// Messages not yet acknowledged, visible or not.
    pub async fn len(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, VecDeque::len)
    }

    async fn take_visible(&self, queue: &str, max: usize) -> Vec<Delivery> {
        let mut queues = self.queues.lock().await;
        let Some(pending) = queues.get_mut(queue) else {
            return Vec::new();
        };

        let now = Instant::now();
        pending
            .iter_mut()
            .filter(|msg| msg.visible_at <= now)
            .take(max)
            .map(|msg| {
                let receipt = Uuid::new_v4().simple().to_string();
                msg.visible_at = now + self.visibility;
                msg.receipt = Some(receipt.clone());
                Delivery { body: msg.body.clone(), receipt }
            })
            .collect()
    }
}

impl Queue for MemoryQueue {
    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.take_visible(queue, max).await;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(Duration::from_millis(20).min(wait)).await;
        }
    }

    async fn ack(&self, queue: &str, receipt: &str) -> Result<()> {
        if let Some(pending) = self.queues.lock().await.get_mut(queue) {
            pending.retain(|msg| msg.receipt.as_deref() != Some(receipt));
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<()> {
        let pending = Pending { body, visible_at: Instant::now(), receipt: None };
        self.queues.lock().await.entry(queue.into()).or_default().push_back(pending);
        Ok(())
    }
}
