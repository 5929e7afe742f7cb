//! Inbound pipeline: reassembly, then storage, then rule dispatch.

use crate::channels::{CompleteMessage, InboundMessage};
use crate::multipart::Reassembler;
use crate::routing::Dispatcher;
use crate::store::MessageStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct Pipeline {
    pub reassembler: Arc<Reassembler>,
    pub store: Arc<MessageStore>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    pub fn new(
        reassembler: Arc<Reassembler>,
        store: Arc<MessageStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            reassembler,
            store,
            dispatcher,
        }
    }

    /// Feed a message from a modem. Returns the number of jobs submitted (0 while a
    /// multipart message is still incomplete).
    pub async fn handle_inbound(&self, msg: InboundMessage) -> usize {
        log::debug!(
            "inbound from {} on {} ({} chars)",
            msg.sender,
            msg.source_channel,
            msg.text.chars().count()
        );
        match self.reassembler.ingest(msg).await {
            Some(complete) => self.handle_complete(complete).await,
            None => 0,
        }
    }

    /// Store and dispatch a complete message (also used for swept and flushed assemblies).
    pub async fn handle_complete(&self, msg: CompleteMessage) -> usize {
        log::info!("message from {} on {}", msg.sender, msg.source_channel);
        self.store
            .append(&msg.source_channel, &msg.sender, &msg.text)
            .await;
        let jobs = self.dispatcher.apply(&msg).await;
        if jobs == 0 {
            log::debug!("message from {}: no jobs submitted", msg.sender);
        }
        jobs
    }
}
