//! The two pipeline stages that run behind a [`Processor`](crate::processor::Processor),
//! and the read side of the sharded aggregate.

use crate::{
    aggregate::{AggregateStore, UpdatePolicy},
    error::Result,
    merge::{decode_shards, merge_encoded, merge_shards},
    model::{Notification, ObjectRef},
    normalize::ColumnLayout,
    processor::Handler,
    storage::{BlobStore, Queue},
    summary::{parse_summary, summarize},
};

use alloc::sync::Arc;
use chrono::Utc;
use futures_util::future::join_all;
use uuid::Uuid;

/// Key prefix under which every aggregate shard is written.
pub const SHARD_PREFIX: &str = "batches/";

/// Splits a CSV body into records. Unreadable lines are logged and dropped.
pub fn read_records(body: &[u8]) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(body);
    reader
        .records()
        .filter_map(|record| match record {
            Ok(record) => Some(record.iter().map(String::from).collect()),
            Err(err) => {
                log::warn!("skipping unreadable line: {err}");
                None
            }
        })
        .collect()
}

/// Name under which the summary of `source_key` is written.
pub fn summary_key(source_key: &str) -> String {
    alloc::format!("daily_summary_{}_{source_key}", Utc::now().date_naive())
}

/// Unique name for a shard produced from `source_key`.
pub fn shard_key(source_key: &str) -> String {
    alloc::format!("{SHARD_PREFIX}{}_{}.bin", Uuid::new_v4(), source_key.replace('/', "_"))
}

async fn remove_source<S: BlobStore>(store: &S, object: &ObjectRef) {
    match store.delete(&object.bucket, &object.key).await {
        Ok(()) => log::info!("deleted source {object}"),
        // The output is durable already; a leftover input only means duplicate work later.
        Err(err) => log::error!("failed to delete source {object}: {err}"),
    }
}

/// Raw capture in, daily summary report out.
pub struct Summarize<S> {
    store: Arc<S>,
    output_bucket: String,
    layout: ColumnLayout,
    delete_source: bool,
}

impl<S> Summarize<S> {
    pub fn new(store: Arc<S>, output_bucket: impl Into<String>) -> Self {
        Self { store, output_bucket: output_bucket.into(), layout: ColumnLayout::default(), delete_source: true }
    }

    pub fn with_layout(mut self, layout: ColumnLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }
}

impl<S: BlobStore> Handler for Summarize<S> {
    async fn handle(&self, object: ObjectRef, body: Vec<u8>) -> Result<Vec<ObjectRef>> {
        let layout = self.layout;
        let summary = tokio::task::spawn_blocking(move || summarize(&read_records(&body), &layout)).await?;
        log::info!("{object}: {} daily rows", summary.len());

        let key = summary_key(&object.key);
        self.store.put(&self.output_bucket, &key, summary.to_csv().into_bytes()).await?;
        log::info!("wrote summary {}/{key}", self.output_bucket);

        if self.delete_source {
            remove_source(&*self.store, &object).await;
        }
        Ok(vec![ObjectRef { bucket: self.output_bucket.clone(), key }])
    }
}

/// Daily summary in, aggregate shard out. Each input produces its own uniquely named
/// shard, so concurrent consolidations never touch the same object.
pub struct Consolidate<S> {
    store: Arc<S>,
    output_bucket: String,
    policy: UpdatePolicy,
    delete_source: bool,
}

impl<S> Consolidate<S> {
    pub fn new(store: Arc<S>, output_bucket: impl Into<String>, policy: UpdatePolicy) -> Self {
        Self { store, output_bucket: output_bucket.into(), policy, delete_source: true }
    }

    pub fn delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }
}

impl<S: BlobStore> Handler for Consolidate<S> {
    async fn handle(&self, object: ObjectRef, body: Vec<u8>) -> Result<Vec<ObjectRef>> {
        let mut shard = AggregateStore::new();
        for (key, sample) in parse_summary(&read_records(&body)) {
            shard.insert(key, sample, self.policy);
        }

        let mut written = Vec::new();
        if shard.is_empty() {
            log::warn!("{object} holds no samples; nothing to write");
        } else {
            let key = shard_key(&object.key);
            self.store.put(&self.output_bucket, &key, shard.encode()?).await?;
            log::info!("wrote shard {}/{key} covering {} flows", self.output_bucket, shard.len());
            written.push(ObjectRef { bucket: self.output_bucket.clone(), key });
        }

        if self.delete_source {
            remove_source(&*self.store, &object).await;
        }
        Ok(written)
    }
}

/// Fetches every shard in `bucket` concurrently. Shards deleted since listing are skipped.
async fn fetch_shards<S: BlobStore>(store: &S, bucket: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let keys = store.list(bucket, SHARD_PREFIX).await?;
    let fetched = join_all(keys.into_iter().map(|key| async move {
        let bytes = store.get(bucket, &key).await?;
        Ok::<_, crate::Error>(bytes.map(|bytes| (key, bytes)))
    }))
    .await;

    let mut shards = Vec::with_capacity(fetched.len());
    for shard in fetched {
        if let Some(shard) = shard? {
            shards.push(shard);
        }
    }
    Ok(shards)
}

/// Reads the logical aggregate: all shards in `bucket`, merged. An empty bucket yields
/// an empty store.
pub async fn load_aggregate<S: BlobStore>(store: &S, bucket: &str) -> Result<AggregateStore> {
    let shards = fetch_shards(store, bucket).await?;
    merge_encoded(shards)
}

/// Folds every readable shard in `bucket` into a single new shard and deletes the inputs.
/// Unreadable shards are left in place. Returns the number of shards folded, which is
/// zero when there were fewer than two to begin with.
pub async fn compact<S: BlobStore>(store: &S, bucket: &str) -> Result<usize> {
    let shards = fetch_shards(store, bucket).await?;
    if shards.len() < 2 {
        log::info!("{} shard(s) in {bucket}; nothing to compact", shards.len());
        return Ok(0);
    }

    let decoded = decode_shards(shards)?;
    let names: Vec<_> = decoded.iter().map(|(name, _)| name.clone()).collect();
    let merged = merge_shards(decoded.into_iter().map(|(_, shard)| shard));

    let key = shard_key("compacted");
    store.put(bucket, &key, merged.encode()?).await?;
    log::info!("compacted {} shards into {bucket}/{key}", names.len());

    // A crash past this point only leaves duplicates, which merging removes.
    for name in &names {
        store.delete(bucket, name).await?;
    }
    Ok(names.len())
}

/// Sends one object-created notification to `queue` for every object in `bucket`,
/// feeding objects that arrived without an event into the pipeline. Returns how many
/// were sent.
pub async fn announce<S: BlobStore, Q: Queue>(store: &S, queue: &Q, bucket: &str, name: &str) -> Result<usize> {
    let keys = store.list(bucket, "").await?;
    for key in &keys {
        let object = ObjectRef { bucket: bucket.to_owned(), key: key.clone() };
        queue.send(name, Notification::created(core::slice::from_ref(&object))).await?;
        log::debug!("announced {object} on {name}");
    }
    Ok(keys.len())
}
