//! Multipart SMS reassembly.
//!
//! Fragments of a concatenated SMS are keyed by (sender, reference, source channel) and
//! merged in part-number order once every part has arrived. A periodic sweep flushes
//! assemblies that stall past the timeout. Completed and flushed keys leave a tombstone
//! for one more timeout window so that replays are recognized as duplicates while a
//! genuinely late fragment is still delivered on its own.

use crate::channels::{CompleteMessage, ConcatHeader, InboundMessage, MultipartInfo};
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssemblyKey {
    sender: String,
    reference: u16,
    source_channel: String,
}

impl AssemblyKey {
    fn of(msg: &InboundMessage, header: &ConcatHeader) -> Self {
        Self {
            sender: msg.sender.clone(),
            reference: header.reference,
            source_channel: msg.source_channel.clone(),
        }
    }
}

struct PartialAssembly {
    first_seen: Instant,
    total_parts: u8,
    parts: BTreeMap<u8, String>,
    /// Receive time of the most recent fragment.
    last_received_at: DateTime<Local>,
}

impl PartialAssembly {
    fn new(total_parts: u8, received_at: DateTime<Local>) -> Self {
        Self {
            first_seen: Instant::now(),
            total_parts,
            parts: BTreeMap::new(),
            last_received_at: received_at,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() >= usize::from(self.total_parts)
    }

    fn into_message(self, key: AssemblyKey) -> (CompleteMessage, Retired) {
        let received = self.parts.len() as u8;
        let text = self.parts.values().map(String::as_str).collect::<String>();
        let message = CompleteMessage {
            sender: key.sender,
            received_at: self.last_received_at,
            text,
            source_channel: key.source_channel,
            multipart: Some(MultipartInfo {
                reference: key.reference,
                part: received,
                total: self.total_parts,
                partial: received < self.total_parts,
            }),
        };
        let retired = Retired {
            parts: self.parts,
            retired_at: Instant::now(),
        };
        (message, retired)
    }
}

/// What a completed or flushed key consumed.
struct Retired {
    parts: BTreeMap<u8, String>,
    retired_at: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<AssemblyKey, PartialAssembly>,
    retired: HashMap<AssemblyKey, Retired>,
}

/// Reassembly engine. All state changes happen under one lock.
pub struct Reassembler {
    timeout: Duration,
    state: Mutex<State>,
}

impl Reassembler {
    /// A zero timeout selects immediate mode: every fragment is delivered on its own.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    pub fn from_minutes(timeout_minutes: u64) -> Self {
        Self::new(Duration::from_secs(timeout_minutes.saturating_mul(60)))
    }

    pub fn is_immediate(&self) -> bool {
        self.timeout.is_zero()
    }

    /// Feed one inbound message. Returns the complete message it finishes, if any.
    pub async fn ingest(&self, msg: InboundMessage) -> Option<CompleteMessage> {
        let Some(header) = msg.concat else {
            return Some(CompleteMessage::single(msg));
        };
        if header.part_number == 0 || header.total_parts == 0 || header.part_number > header.total_parts
        {
            log::warn!(
                "multipart: malformed header from {} (part {}/{}), delivering fragment as is",
                msg.sender,
                header.part_number,
                header.total_parts
            );
            return Some(CompleteMessage::lone_fragment(msg, header));
        }
        if self.is_immediate() {
            return Some(CompleteMessage::lone_fragment(msg, header));
        }

        let key = AssemblyKey::of(&msg, &header);
        let mut state = self.state.lock().await;
        let timeout = self.timeout;
        state
            .retired
            .retain(|_, r| r.retired_at.elapsed() <= timeout);

        if let Some(assembly) = state.pending.get_mut(&key) {
            if assembly.total_parts != header.total_parts {
                log::warn!(
                    "multipart: part {}/{} from {} (ref {}) disagrees with {} expected parts, delivering on its own",
                    header.part_number,
                    header.total_parts,
                    key.sender,
                    key.reference,
                    assembly.total_parts
                );
                let mut lone = CompleteMessage::lone_fragment(msg, header);
                if let Some(info) = lone.multipart.as_mut() {
                    info.partial = true;
                }
                return Some(lone);
            }
            if assembly.parts.contains_key(&header.part_number) {
                log::warn!(
                    "multipart: duplicate part {}/{} from {} (ref {}), ignored",
                    header.part_number,
                    header.total_parts,
                    key.sender,
                    key.reference
                );
                return None;
            }
            assembly.parts.insert(header.part_number, msg.text);
            assembly.last_received_at = msg.received_at;
        } else if let Some(retired) = state.retired.get_mut(&key) {
            if retired.parts.get(&header.part_number) == Some(&msg.text) {
                log::warn!(
                    "multipart: replayed part {}/{} from {} (ref {}), ignored",
                    header.part_number,
                    header.total_parts,
                    key.sender,
                    key.reference
                );
                return None;
            }
            log::warn!(
                "multipart: late part {}/{} from {} (ref {}), delivering on its own",
                header.part_number,
                header.total_parts,
                key.sender,
                key.reference
            );
            retired
                .parts
                .entry(header.part_number)
                .or_insert_with(|| msg.text.clone());
            let mut lone = CompleteMessage::lone_fragment(msg, header);
            if let Some(info) = lone.multipart.as_mut() {
                info.partial = true;
            }
            return Some(lone);
        } else {
            log::debug!(
                "multipart: new assembly from {} (ref {}, {} parts)",
                key.sender,
                key.reference,
                header.total_parts
            );
            let mut assembly = PartialAssembly::new(header.total_parts, msg.received_at);
            assembly.parts.insert(header.part_number, msg.text);
            state.pending.insert(key.clone(), assembly);
        }

        let complete = state
            .pending
            .get(&key)
            .map(PartialAssembly::is_complete)
            .unwrap_or(false);
        if !complete {
            return None;
        }
        let assembly = state.pending.remove(&key)?;
        let (message, retired) = assembly.into_message(key.clone());
        log::debug!(
            "multipart: merged {} parts from {} (ref {})",
            retired.parts.len(),
            key.sender,
            key.reference
        );
        state.retired.insert(key, retired);
        Some(message)
    }

    /// Flush every assembly whose first fragment is older than the timeout.
    pub async fn sweep(&self) -> Vec<CompleteMessage> {
        let timeout = self.timeout;
        self.flush_where(|a| a.first_seen.elapsed() > timeout).await
    }

    /// Flush every pending assembly regardless of age (shutdown).
    pub async fn flush_all(&self) -> Vec<CompleteMessage> {
        self.flush_where(|_| true).await
    }

    async fn flush_where(&self, pred: impl Fn(&PartialAssembly) -> bool) -> Vec<CompleteMessage> {
        let mut state = self.state.lock().await;
        let mut expired: Vec<AssemblyKey> = state
            .pending
            .iter()
            .filter(|(_, a)| pred(a))
            .map(|(k, _)| k.clone())
            .collect();
        expired.sort_by_key(|k| state.pending.get(k).map(|a| a.first_seen));

        let mut flushed = Vec::with_capacity(expired.len());
        for key in expired {
            let Some(assembly) = state.pending.remove(&key) else {
                continue;
            };
            log::warn!(
                "multipart: flushing incomplete message from {} (ref {}, {}/{} parts)",
                key.sender,
                key.reference,
                assembly.parts.len(),
                assembly.total_parts
            );
            let (message, retired) = assembly.into_message(key.clone());
            state.retired.insert(key, retired);
            flushed.push(message);
        }
        flushed
    }

    /// Assemblies still waiting for parts.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Run the timeout sweep every `interval` until `shutdown` flips, sending flushed
    /// messages to `out`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        out: mpsc::Sender<CompleteMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for message in self.sweep().await {
                            if out.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("multipart: sweeper stopped");
        })
    }
}
