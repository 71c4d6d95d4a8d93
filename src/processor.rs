use crate::{
    error::{Error, Result},
    model::{Notification, ObjectRef},
    pool::WorkerPool,
    storage::{BlobStore, Delivery, Queue},
};

use alloc::sync::Arc;
use core::{fmt, future::Future, time::Duration};
use futures_util::future::join_all;

/// Consumes one downloaded input object. Must only return `Ok` once its output has been
/// durably written, and returns the objects it wrote so they can be announced downstream.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, object: ObjectRef, body: Vec<u8>) -> impl Future<Output = Result<Vec<ObjectRef>>> + Send;
}

/// Lifecycle of one message within a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Downloading,
    Processing,
    Acknowledged,
    /// Not acknowledged; the queue redelivers it once the visibility timeout lapses.
    LeftForRedelivery,
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "RECEIVED",
            Self::Downloading => "DOWNLOADING",
            Self::Processing => "PROCESSING",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::LeftForRedelivery => "LEFT_FOR_REDELIVERY",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub receipt: String,
    pub state: MessageState,
}

impl Outcome {
    fn advance(&mut self, state: MessageState) {
        log::debug!("message {}: {} -> {state}", self.receipt, self.state);
        self.state = state;
    }
}

/// Final state of every message of a batch, in receive order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
}

impl BatchReport {
    pub fn count(&self, state: MessageState) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.state == state).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Queue to poll.
    pub queue: String,
    /// Most messages taken per receive.
    pub max_messages: usize,
    /// Long-poll wait per receive.
    pub wait: Duration,
    /// Worker pool size, bounding concurrent downloads and handlers.
    pub concurrency: usize,
    /// Queue told about every object a handler writes.
    pub next_queue: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            max_messages: 10,
            wait: Duration::from_secs(10),
            concurrency: 5,
            next_queue: None,
        }
    }
}

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

async fn acknowledge<Q: Queue>(queue: &Q, name: &str, receipt: &str) -> MessageState {
    match queue.ack(name, receipt).await {
        Ok(()) => MessageState::Acknowledged,
        Err(err) => {
            // The write already happened; a redelivery is absorbed by dedup on merge.
            log::error!("failed to acknowledge {receipt}: {err}");
            MessageState::LeftForRedelivery
        }
    }
}

/// Handles one object and announces its outputs on `next`, if any.
async fn handle_object<Q: Queue, H: Handler>(
    queue: &Q,
    handler: &H,
    next: Option<&str>,
    object: ObjectRef,
    body: Vec<u8>,
) -> Result<()> {
    let label = object.to_string();
    let outputs = handler.handle(object, body).await?;
    log::info!("processed {label} into {} object(s)", outputs.len());

    if let Some(next) = next {
        if !outputs.is_empty() {
            queue.send(next, Notification::created(&outputs)).await?;
            log::debug!("announced outputs of {label} on {next}");
        }
    }
    Ok(())
}

/// Polls a queue for object notifications and runs each through a [`Handler`].
///
/// Every message is handled and acknowledged on its own: a failure leaves only that
/// message unacknowledged, so the queue redelivers it later, while its siblings proceed.
/// A message naming several objects is acknowledged once all of them were handled.
pub struct Processor<Q, S, H> {
    queue: Arc<Q>,
    store: Arc<S>,
    handler: Arc<H>,
    config: ProcessorConfig,
}

impl<Q: Queue, S: BlobStore, H: Handler> Processor<Q, S, H> {
    pub fn new(queue: Arc<Q>, store: Arc<S>, handler: Arc<H>, config: ProcessorConfig) -> Self {
        Self { queue, store, handler, config }
    }

    /// Polls until `stop` resolves. A batch already received is always finished; only
    /// further polls are abandoned. Queued work is drained before returning.
    pub async fn run<F: Future>(&self, stop: F) {
        let pool = WorkerPool::new(self.config.concurrency);
        let mut stop = core::pin::pin!(stop);
        log::info!("polling queue {} with {} workers", self.config.queue, pool.size());

        loop {
            let res = tokio::select! {
                res = self.receive() => res,
                _ = &mut stop => break,
            };

            let batch = match res {
                Ok(batch) => batch,
                Err(err) => {
                    log::error!("receive from {} failed: {err}", self.config.queue);
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                        _ = &mut stop => break,
                    }
                }
            };

            if batch.is_empty() {
                log::debug!("no messages available");
                continue;
            }

            self.process_batch(&pool, batch).await;
        }

        log::warn!("stopped polling {}; draining workers", self.config.queue);
        pool.shutdown().await;
    }

    fn receive(&self) -> impl Future<Output = Result<Vec<Delivery>>> + Send + '_ {
        self.queue.receive(&self.config.queue, self.config.max_messages, self.config.wait)
    }

    /// Receives one batch and processes it.
    pub async fn poll_once(&self, pool: &WorkerPool) -> Result<BatchReport> {
        let batch = self.receive().await?;
        Ok(self.process_batch(pool, batch).await)
    }

    /// Downloads the inputs of the whole batch concurrently, then handles every object.
    /// A message is acknowledged only once all of its objects were handled.
    pub async fn process_batch(&self, pool: &WorkerPool, batch: Vec<Delivery>) -> BatchReport {
        log::info!("processing batch of {} messages", batch.len());
        let mut outcomes: Vec<_> = batch
            .iter()
            .map(|delivery| Outcome { receipt: delivery.receipt.clone(), state: MessageState::Received })
            .collect();

        let mut actionable = Vec::with_capacity(batch.len());
        for (index, delivery) in batch.iter().enumerate() {
            match Notification::parse(&delivery.body) {
                Ok(Notification::Test) => {
                    log::info!("test event received; acknowledging without processing");
                    let state = acknowledge(&*self.queue, &self.config.queue, &delivery.receipt).await;
                    outcomes[index].advance(state);
                }
                Ok(Notification::Objects(objects)) => actionable.push((index, objects)),
                Err(err) => {
                    log::error!("cannot interpret message {}: {err}; body: {}", delivery.receipt, delivery.body);
                    outcomes[index].advance(MessageState::LeftForRedelivery);
                }
            }
        }

        let mut downloads = Vec::new();
        for (index, objects) in actionable {
            outcomes[index].advance(MessageState::Downloading);
            for object in objects {
                let store = self.store.clone();
                let ticket = pool
                    .submit(async move {
                        log::info!("downloading {object}");
                        let body = store.get(&object.bucket, &object.key).await;
                        (object, body)
                    })
                    .await;
                downloads.push((index, ticket));
            }
        }

        let downloads =
            join_all(downloads.into_iter().map(|(index, ticket)| async move { (index, ticket.join().await) })).await;

        // Any failed object sends its whole message back.
        let mut fetched = Vec::with_capacity(downloads.len());
        for (index, download) in downloads {
            match download {
                Some((object, Ok(Some(body)))) => fetched.push((index, object, body)),
                Some((object, Ok(None))) => {
                    let err = Error::Missing { bucket: object.bucket, key: object.key };
                    log::error!("{err}");
                    outcomes[index].advance(MessageState::LeftForRedelivery);
                }
                Some((object, Err(err))) => {
                    log::error!("download of {object} failed: {err}");
                    outcomes[index].advance(MessageState::LeftForRedelivery);
                }
                None => {
                    log::error!("download task for message {} died", outcomes[index].receipt);
                    outcomes[index].advance(MessageState::LeftForRedelivery);
                }
            }
        }

        let mut handled = Vec::with_capacity(fetched.len());
        for (index, object, body) in fetched {
            match outcomes[index].state {
                MessageState::Downloading => outcomes[index].advance(MessageState::Processing),
                MessageState::Processing => {}
                // A sibling object already failed; the whole message comes back anyway.
                _ => continue,
            }

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let next = self.config.next_queue.clone();
            let ticket = pool
                .submit(async move {
                    let label = object.to_string();
                    let res = handle_object(&*queue, &*handler, next.as_deref(), object, body).await;
                    if let Err(err) = &res {
                        log::error!("processing {label} failed: {err}");
                    }
                    res.is_ok()
                })
                .await;
            handled.push((index, ticket));
        }

        for (index, ticket) in handled {
            if ticket.join().await != Some(true) && outcomes[index].state == MessageState::Processing {
                outcomes[index].advance(MessageState::LeftForRedelivery);
            }
        }

        for (index, delivery) in batch.iter().enumerate() {
            if outcomes[index].state == MessageState::Processing {
                let state = acknowledge(&*self.queue, &self.config.queue, &delivery.receipt).await;
                outcomes[index].advance(state);
            }
        }

        let report = BatchReport { outcomes };
        log::info!(
            "batch done: {} acknowledged, {} left for redelivery",
            report.count(MessageState::Acknowledged),
            report.count(MessageState::LeftForRedelivery)
        );
        report
    }
}
