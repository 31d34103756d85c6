use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Outcome of one worker attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The task is fully handled, including its acknowledgement.
    Done,
    /// Recoverable failure: run the task again, up to `max_retries`.
    Retry(String),
}

/// One validation worker. Implementations own the end-to-end handling of
/// a task: workflow execution, record calls, publication, reporting, and
/// the final acknowledgement.
#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
    type Task: Send + 'static;

    async fn run(&self, task: &mut Self::Task, attempt: u32) -> Outcome;

    /// Every attempt asked to retry. Implementations typically alert and
    /// return the delivery to the broker.
    async fn exhausted(&self, task: Self::Task, last_reason: String);
}

/// Bounded worker pool. The dispatcher must `acquire` a slot before
/// pulling the next delivery, so at most `n_workers` validations are in
/// flight at once; a task that reports a recoverable failure is re-run
/// with an attempt counter, capped at `max_retries`.
pub struct Pool<W: Worker> {
    worker: Arc<W>,
    slots: Arc<Semaphore>,
    max_retries: u32,
    retry_pause: std::time::Duration,
}

impl<W: Worker> Pool<W> {
    pub fn new(worker: W, n_workers: usize, max_retries: u32) -> Self {
        Self {
            worker: Arc::new(worker),
            slots: Arc::new(Semaphore::new(n_workers)),
            max_retries,
            retry_pause: std::time::Duration::from_secs(3),
        }
    }

    #[cfg(test)]
    fn with_retry_pause(mut self, pause: std::time::Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Wait until a worker slot is free.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed")
    }

    /// Hand `task` to a worker on the acquired slot.
    pub fn spawn(&self, permit: OwnedSemaphorePermit, mut task: W::Task) -> tokio::task::JoinHandle<()> {
        let worker = self.worker.clone();
        let max_retries = self.max_retries;
        let retry_pause = self.retry_pause;

        tokio::spawn(async move {
            let _permit = permit;
            let mut attempt = 0;

            loop {
                match worker.run(&mut task, attempt).await {
                    Outcome::Done => return,
                    Outcome::Retry(reason) => {
                        attempt += 1;
                        if attempt > max_retries {
                            tracing::error!(%reason, attempt, "task exhausted its retries");
                            worker.exhausted(task, reason).await;
                            return;
                        }
                        tracing::warn!(%reason, attempt, "task failed, retrying");
                        tokio::time::sleep(retry_pause).await;
                    }
                }
            }
        })
    }
}
