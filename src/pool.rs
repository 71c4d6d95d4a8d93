use alloc::{boxed::Box, sync::Arc};
use core::{future::Future, pin::Pin};
use futures_util::FutureExt;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Fixed set of workers draining a bounded channel of jobs. Submitting blocks while the
/// channel is full; [`WorkerPool::shutdown`] closes the channel and waits for every
/// queued job to finish.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

/// Handle to the eventual output of a submitted job.
pub struct Ticket<T>(oneshot::Receiver<T>);

impl<T> Ticket<T> {
    /// Resolves to [`None`] if the job panicked.
    pub async fn join(self) -> Option<T> {
        self.0.await.ok()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (jobs, rx) = mpsc::channel::<Job>(size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        // Only one idle worker waits on the channel at a time.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        // A panicking job must not take its worker down with it.
                        if let Err(err) = tokio::spawn(job).await {
                            log::error!("job on worker {id} failed: {err}");
                        }
                    }
                    log::debug!("worker {id} drained");
                })
            })
            .collect();

        Self { jobs, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job and returns a ticket for its output.
    pub async fn submit<F>(&self, job: F) -> Ticket<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = job.map(move |out| {
            // The submitter may have stopped waiting.
            let _ = tx.send(out);
        });

        if self.jobs.send(job.boxed()).await.is_err() {
            log::error!("worker pool is closed; dropping job");
        }
        Ticket(rx)
    }

    /// Stops accepting jobs and waits until every queued job has run.
    pub async fn shutdown(self) {
        let Self { jobs, workers } = self;
        drop(jobs);
        for worker in workers {
            if let Err(err) = worker.await {
                log::error!("worker terminated abnormally: {err}");
            }
        }
    }
}
