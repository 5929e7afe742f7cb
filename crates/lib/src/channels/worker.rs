//! Channel worker: drains one channel's queue, one job at a time, with retry and backoff.
//!
//! The worker is generic over a [`Delivery`] capability; modem, email and API channels
//! differ only in what delivering a job means.

use crate::channels::error::DeliveryError;
use crate::channels::queue::{JobQueue, OutboundJob};
use crate::channels::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Kind-specific delivery of one job through an external transport.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError>;

    /// Called after each job leaves the queue (delivered, rescheduled, or dropped).
    async fn after_job(&self) {}

    /// Release the transport once the worker has drained its queue.
    async fn close(&self) {}
}

#[async_trait]
impl<D: Delivery + ?Sized> Delivery for Arc<D> {
    async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError> {
        (**self).deliver(job).await
    }

    async fn after_job(&self) {
        (**self).after_job().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    /// Failed, waited out the backoff, and went back to the tail of the queue.
    Retrying,
    /// Failed with no retries left.
    Exhausted,
    /// Failed permanently (e.g. malformed destination).
    Rejected,
}

/// Single consumer of a channel's queue.
pub struct ChannelWorker<D> {
    name: String,
    delivery: D,
    queue: Arc<JobQueue>,
    policy: RetryPolicy,
}

impl<D: Delivery + 'static> ChannelWorker<D> {
    pub fn new(
        name: impl Into<String>,
        delivery: D,
        queue: Arc<JobQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            delivery,
            queue,
            policy,
        }
    }

    /// Run the worker on its own task. The task ends after the queue is closed and drained.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        log::debug!("channel {}: worker started", self.name);
        while let Some(job) = self.queue.pop().await {
            self.process(job).await;
            self.delivery.after_job().await;
        }
        self.delivery.close().await;
        log::info!("channel {}: queue drained, worker stopped", self.name);
    }

    /// Attempt one job. On a retryable failure the worker sleeps for the backoff
    /// (stalling this channel only) and re-enqueues the job at the tail.
    pub async fn process(&self, mut job: OutboundJob) -> JobOutcome {
        log::debug!(
            "channel {}: delivering to {} (retry {}), {} queued",
            self.name,
            job.destination,
            job.retry_count,
            self.queue.len().await
        );
        let err = match self.delivery.deliver(&job).await {
            Ok(()) => {
                log::info!("channel {}: delivered to {}", self.name, job.destination);
                return JobOutcome::Delivered;
            }
            Err(e) => e,
        };
        if !err.is_retryable() {
            log::warn!(
                "channel {}: dropping job for {}: {}",
                self.name,
                job.destination,
                err
            );
            return JobOutcome::Rejected;
        }
        if !self.policy.should_retry(job.retry_count) {
            log::error!(
                "channel {}: max retries ({}) reached for {}, dropping job: {}",
                self.name,
                self.policy.max_retries,
                job.destination,
                err
            );
            return JobOutcome::Exhausted;
        }
        let delay = self.policy.delay_for(job.retry_count);
        log::warn!(
            "channel {}: delivery to {} failed: {}; retry {}/{} in {:?}",
            self.name,
            job.destination,
            err,
            job.retry_count + 1,
            self.policy.max_retries,
            delay
        );
        tokio::time::sleep(delay).await;
        job.retry_count += 1;
        self.queue.requeue(job).await;
        JobOutcome::Retrying
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails the first `failures` attempts, records every attempt.
    #[derive(Default)]
    struct Flaky {
        failures: usize,
        attempts: Mutex<Vec<(String, u32, Instant)>>,
        after_job_calls: AtomicUsize,
        closed: AtomicUsize,
        bad_address: bool,
    }

    impl Flaky {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                ..Default::default()
            })
        }

        fn attempts(&self) -> Vec<(String, u32, Instant)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Delivery for Flaky {
        async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError> {
            let n = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push((job.text.clone(), job.retry_count, Instant::now()));
                attempts.len()
            };
            if self.bad_address {
                return Err(DeliveryError::Address(job.destination.clone()));
            }
            if n <= self.failures {
                Err(DeliveryError::Unavailable("down".to_string()))
            } else {
                Ok(())
            }
        }

        async fn after_job(&self) {
            self.after_job_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn worker(delivery: Arc<Flaky>, max_retries: u32) -> (ChannelWorker<Arc<Flaky>>, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new());
        let policy = RetryPolicy::new(max_retries, Duration::from_secs(10));
        (
            ChannelWorker::new("test", delivery, queue.clone(), policy),
            queue,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_is_delivered_once() {
        let delivery = Flaky::failing(0);
        let (worker, queue) = worker(delivery.clone(), 3);
        queue.push(OutboundJob::new("+15551234567", "hi")).await;
        queue.close().await;
        worker.run().await;
        assert_eq!(delivery.attempts().len(), 1);
        assert_eq!(delivery.after_job_calls.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_backs_off_exponentially() {
        let delivery = Flaky::failing(2);
        let (worker, queue) = worker(delivery.clone(), 3);
        queue.push(OutboundJob::new("+15551234567", "hi")).await;
        queue.close().await;
        worker.run().await;

        let attempts = delivery.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].1, 0);
        assert_eq!(attempts[1].1, 1);
        assert_eq!(attempts[2].1, 2);
        assert_eq!(attempts[1].2 - attempts[0].2, Duration::from_secs(10));
        assert_eq!(attempts[2].2 - attempts[1].2, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn job_dropped_after_max_retries() {
        let delivery = Flaky::failing(usize::MAX);
        let (worker, queue) = worker(delivery.clone(), 2);
        queue.push(OutboundJob::new("+15551234567", "hi")).await;
        queue.close().await;
        worker.run().await;
        // first attempt + 2 retries, then nothing more
        assert_eq!(delivery.attempts().len(), 3);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn process_reports_each_state() {
        let delivery = Flaky::failing(1);
        let (worker, queue) = worker(delivery.clone(), 1);
        assert_eq!(
            worker.process(OutboundJob::new("+1", "a")).await,
            JobOutcome::Retrying
        );
        let retried = queue.pop().await.unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(worker.process(retried).await, JobOutcome::Delivered);

        let exhausted = OutboundJob {
            retry_count: 1,
            ..OutboundJob::new("+1", "b")
        };
        let always_failing = Flaky::failing(usize::MAX);
        let (worker, _) = self::worker(always_failing, 1);
        assert_eq!(worker.process(exhausted).await, JobOutcome::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_destination_is_never_retried() {
        let delivery = Arc::new(Flaky {
            bad_address: true,
            ..Default::default()
        });
        let (worker, queue) = worker(delivery.clone(), 3);
        assert_eq!(
            worker.process(OutboundJob::new("nobody", "x")).await,
            JobOutcome::Rejected
        );
        assert!(queue.is_empty().await);
        assert_eq!(delivery.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_job_goes_behind_later_submissions() {
        let delivery = Flaky::failing(1);
        let (worker, queue) = worker(delivery.clone(), 3);
        queue.push(OutboundJob::new("+1", "first")).await;
        queue.push(OutboundJob::new("+1", "second")).await;
        queue.close().await;
        worker.run().await;
        let order: Vec<String> = delivery.attempts().into_iter().map(|a| a.0).collect();
        assert_eq!(order, vec!["first", "second", "first"]);
    }
}
