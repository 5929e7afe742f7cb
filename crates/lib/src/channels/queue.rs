//! Per-channel FIFO job queue. Many producers (rule dispatch), one consumer (the channel worker).

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// One outbound delivery: destination + rendered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundJob {
    /// Phone number, email address, or (API channels) the original sender.
    pub destination: String,
    pub text: String,
    /// Receive time of the originating message (API `{timestamp}` substitution).
    pub timestamp: Option<String>,
    pub retry_count: u32,
}

impl OutboundJob {
    pub fn new(destination: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            text: text.into(),
            timestamp: None,
            retry_count: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

struct QueueState {
    jobs: VecDeque<OutboundJob>,
    closed: bool,
}

/// FIFO queue with close-then-drain semantics: after `close`, new submissions are
/// refused but the consumer keeps receiving jobs until the queue is empty.
pub struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            wake: Notify::new(),
        }
    }

    /// Submit a job at the tail. Returns false (job dropped) when the queue is closed.
    pub async fn push(&self, job: OutboundJob) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.jobs.push_back(job);
        drop(state);
        self.wake.notify_one();
        true
    }

    /// Put a retried job back at the tail. Accepted while draining after close.
    pub async fn requeue(&self, job: OutboundJob) {
        self.state.lock().await.jobs.push_back(job);
        self.wake.notify_one();
    }

    /// Wait for the next job. Returns None once the queue is closed and empty.
    pub async fn pop(&self) -> Option<OutboundJob> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    /// Stop accepting new jobs; the consumer drains what is left.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.wake.notify_one();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Clone of the jobs currently waiting, head first.
    pub async fn pending(&self) -> Vec<OutboundJob> {
        self.state.lock().await.jobs.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pops_in_submission_order() {
        let queue = JobQueue::new();
        assert!(queue.push(OutboundJob::new("+1", "a")).await);
        assert!(queue.push(OutboundJob::new("+2", "b")).await);
        assert_eq!(queue.pop().await.unwrap().text, "a");
        assert_eq!(queue.pop().await.unwrap().text, "b");
    }

    #[tokio::test]
    async fn requeued_job_joins_the_tail() {
        let queue = JobQueue::new();
        queue.push(OutboundJob::new("+1", "first")).await;
        queue.push(OutboundJob::new("+1", "second")).await;
        let mut job = queue.pop().await.unwrap();
        job.retry_count += 1;
        queue.requeue(job).await;
        let texts: Vec<String> = queue.pending().await.into_iter().map(|j| j.text).collect();
        assert_eq!(texts, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn closed_queue_refuses_new_jobs_but_drains() {
        let queue = JobQueue::new();
        queue.push(OutboundJob::new("+1", "kept")).await;
        queue.close().await;
        assert!(!queue.push(OutboundJob::new("+1", "refused")).await);
        assert_eq!(queue.pop().await.unwrap().text, "kept");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push_from_another_task() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(OutboundJob::new("+1", "late")).await;
        let job = consumer.await.unwrap().unwrap();
        assert_eq!(job.text, "late");
    }
}
