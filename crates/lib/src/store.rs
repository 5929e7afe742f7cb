//! Volatile message store: completed inbound messages in arrival order, evicted after
//! the retention window. Nothing is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// How often the evictor runs.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub source_channel: String,
    pub sender: String,
    pub text: String,
    pub stored_at: DateTime<Utc>,
}

pub struct MessageStore {
    retention: chrono::Duration,
    messages: RwLock<VecDeque<StoredMessage>>,
}

impl MessageStore {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention: chrono::Duration::days(i64::from(retention_days)),
            messages: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn append(&self, source_channel: &str, sender: &str, text: &str) {
        self.append_at(source_channel, sender, text, Utc::now()).await;
    }

    async fn append_at(&self, source_channel: &str, sender: &str, text: &str, at: DateTime<Utc>) {
        self.messages.write().await.push_back(StoredMessage {
            source_channel: source_channel.to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            stored_at: at,
        });
    }

    /// Stored messages in insertion order.
    pub async fn snapshot(&self) -> Vec<StoredMessage> {
        self.messages.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove entries older than the retention window. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return 0;
        };
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| m.stored_at >= cutoff);
        before - messages.len()
    }

    /// Evict on `interval` until `shutdown` flips.
    pub fn spawn_evictor(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.evict_expired().await;
                        if removed > 0 {
                            log::info!("store: evicted {} expired message(s)", removed);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("store: evictor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_keeps_insertion_order() {
        let store = MessageStore::new(7);
        store.append("modem1", "+1555", "first").await;
        store.append("modem2", "+1666", "second").await;
        let texts: Vec<String> = store.snapshot().await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn messages_older_than_retention_are_evicted() {
        let store = MessageStore::new(7);
        let now = Utc::now();
        store
            .append_at("modem1", "+1555", "old", now - chrono::Duration::seconds(7 * 86_400 + 1))
            .await;
        store
            .append_at("modem1", "+1555", "edge", now - chrono::Duration::seconds(7 * 86_400))
            .await;
        store.append_at("modem1", "+1555", "new", now).await;

        assert_eq!(store.evict_expired_at(now).await, 1);
        let texts: Vec<String> = store.snapshot().await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["edge", "new"]);
    }

    #[tokio::test]
    async fn zero_retention_keeps_only_the_present() {
        let store = MessageStore::new(0);
        let now = Utc::now();
        store
            .append_at("modem1", "+1555", "past", now - chrono::Duration::seconds(1))
            .await;
        assert_eq!(store.evict_expired_at(now).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn evictor_removes_expired_messages_on_each_interval() {
        let store = Arc::new(MessageStore::new(1));
        store
            .append_at("modem1", "+1555", "old", Utc::now() - chrono::Duration::days(2))
            .await;
        store.append("modem1", "+1555", "new").await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let evictor = store.clone().spawn_evictor(Duration::from_secs(3600), stop_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.len().await, 2);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let texts: Vec<String> = store.snapshot().await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["new"]);

        stop_tx.send(true).unwrap();
        evictor.await.unwrap();
    }

    #[test]
    fn stored_message_serializes_camel_case() {
        let msg = StoredMessage {
            source_channel: "modem1".to_string(),
            sender: "+1555".to_string(),
            text: "hi".to_string(),
            stored_at: DateTime::parse_from_rfc3339("2024-07-10T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["sourceChannel"], "modem1");
        assert_eq!(v["storedAt"], "2024-07-10T12:00:00Z");
    }
}
