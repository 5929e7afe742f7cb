//! Channel registry: outbound channels by name. Rules address channels only by name,
//! so dispatch never holds a direct reference to a worker.

use crate::channels::queue::{JobQueue, OutboundJob};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Modem,
    Email,
    Api,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Modem => "modem",
            Self::Email => "email",
            Self::Api => "api",
        })
    }
}

/// A running channel as seen by dispatch: its kind and its queue.
#[derive(Clone)]
pub struct ChannelHandle {
    pub name: String,
    pub kind: ChannelKind,
    queue: Arc<JobQueue>,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>, kind: ChannelKind, queue: Arc<JobQueue>) -> Self {
        Self {
            name: name.into(),
            kind,
            queue,
        }
    }

    /// Submit a job; returns false once the channel is shutting down.
    pub async fn enqueue(&self, job: OutboundJob) -> bool {
        self.queue.push(job).await
    }

    pub async fn queued(&self) -> usize {
        self.queue.len().await
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// Registry of channel names to handles. Shared across the gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, ChannelHandle>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, handle: ChannelHandle) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(handle.name.clone(), handle) {
            log::warn!("channel {}: replaced, closing previous queue", old.name);
            old.queue.close().await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<ChannelHandle> {
        let g = self.inner.read().await;
        g.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut names: Vec<String> = g.keys().cloned().collect();
        names.sort();
        names
    }

    /// All handles, sorted by name.
    pub async fn handles(&self) -> Vec<ChannelHandle> {
        let g = self.inner.read().await;
        let mut handles: Vec<ChannelHandle> = g.values().cloned().collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    /// Stop accepting jobs on every channel. Workers keep draining what is queued.
    pub async fn close_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.queue.close().await;
        }
    }
}
