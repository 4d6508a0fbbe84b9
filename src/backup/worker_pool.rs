//! Bounded, FIFO-per-channel job executor.
//!
//! A named unit of work, handed a cooperative cancellation handle, with a
//! single completion notification. `WorkerPool` generalises that single-shot
//! spawn into a bounded queue: a single dispatcher task drains jobs in
//! submission order and hands each one a `tokio::sync::Semaphore` permit
//! before spawning it, so admission order is preserved even though execution
//! is concurrent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;
use tokio::sync::{mpsc, Notify, Semaphore};

use super::types::{Datatype, JobOutcome};

/// Cooperative cancellation handle. The running job polls `is_cancelled()`
/// at chunk boundaries.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(CancelInner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

type JobFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type JobFn = Box<dyn FnOnce(CancelToken) -> JobFuture + Send>;
type CallbackFn = Box<dyn FnOnce(JobOutcome) + Send>;

struct Job {
    #[allow(dead_code)]
    entity_id: i64,
    #[allow(dead_code)]
    datatype: Datatype,
    cancel: CancelToken,
    work: JobFn,
    callback: CallbackFn,
}

/// One bounded, FIFO queue of jobs (either the fetch pool or the checksum
/// pool).
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
}

impl WorkerPool {
    /// `concurrency` is the pool's cap on simultaneously-executing jobs:
    /// the upstream connection limit for the fetch pool, the checksum
    /// concurrency (typically CPU count) for the checksum pool.
    pub fn new(concurrency: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                tokio::spawn(async move {
                    let outcome = if job.cancel.is_cancelled() {
                        JobOutcome::Cancelled
                    } else {
                        match (job.work)(job.cancel.clone()).await {
                            Ok(()) => JobOutcome::Finished,
                            Err(err) => JobOutcome::Failed(err.to_string()),
                        }
                    };
                    drop(permit);
                    (job.callback)(outcome);
                });
            }
        });

        WorkerPool { sender }
    }

    /// Enqueues a job; acceptance is non-blocking and FIFO. Returns an
    /// error only once the pool has shut down (the dispatcher task ended).
    pub fn submit<W, Fut, C>(
        &self,
        entity_id: i64,
        datatype: Datatype,
        cancel: CancelToken,
        work: W,
        callback: C,
    ) -> Result<(), Error>
    where
        W: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
        C: FnOnce(JobOutcome) + Send + 'static,
    {
        let job = Job {
            entity_id,
            datatype,
            cancel,
            work: Box::new(move |token| Box::pin(work(token))),
            callback: Box::new(callback),
        };
        self.sender
            .send(job)
            .map_err(|_| anyhow::format_err!("worker pool has shut down"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn jobs_run_and_callback_fires_exactly_once() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel();

        pool.submit(
            1,
            Datatype::Data,
            CancelToken::new(),
            |_cancel| async { Ok(()) },
            move |outcome| {
                tx.send(outcome).ok();
            },
        )
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Finished));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..6 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            let (tx, rx) = oneshot::channel();
            pool.submit(
                1,
                Datatype::Data,
                CancelToken::new(),
                move |_cancel| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                move |outcome| {
                    tx.send(outcome).ok();
                },
            )
            .unwrap();
            receivers.push(rx);
        }

        for rx in receivers {
            tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled() {
        let pool = WorkerPool::new(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let (tx, rx) = oneshot::channel();

        pool.submit(
            1,
            Datatype::Checksums,
            cancel,
            |_cancel| async { Ok(()) },
            move |outcome| {
                tx.send(outcome).ok();
            },
        )
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn job_error_reports_failed() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = oneshot::channel();

        pool.submit(
            1,
            Datatype::Data,
            CancelToken::new(),
            |_cancel| async { Err(anyhow::format_err!("boom")) },
            move |outcome| {
                tx.send(outcome).ok();
            },
        )
        .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        match outcome {
            JobOutcome::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
