//! Modem channel: outbound SMS through a modem link, gated on network coverage.

use crate::channels::error::DeliveryError;
use crate::channels::queue::OutboundJob;
use crate::channels::worker::Delivery;
use crate::config::ModemConfig;
use crate::modem::{ModemError, ModemLink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Pause between coverage attempts inside one delivery.
const NO_COVERAGE_PAUSE: Duration = Duration::from_secs(5);

pub struct ModemDelivery {
    link: Arc<dyn ModemLink>,
    network_retries: u32,
    coverage_timeout: Duration,
}

impl ModemDelivery {
    pub fn new(link: Arc<dyn ModemLink>, config: &ModemConfig) -> Self {
        Self {
            link,
            network_retries: config.network_retries.max(1),
            coverage_timeout: Duration::from_secs(config.coverage_timeout_seconds),
        }
    }
}

#[async_trait]
impl Delivery for ModemDelivery {
    /// Send once coverage is available. Up to `network_retries` coverage checks run
    /// before the attempt is reported as failed to the worker's retry policy.
    async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError> {
        for attempt in 1..=self.network_retries {
            if self.link.wait_for_coverage(self.coverage_timeout).await? {
                self.link.send_message(&job.destination, &job.text).await?;
                return Ok(());
            }
            log::warn!(
                "modem {}: no network coverage (attempt {}/{})",
                self.link.name(),
                attempt,
                self.network_retries
            );
            if attempt < self.network_retries {
                tokio::time::sleep(NO_COVERAGE_PAUSE).await;
            }
        }
        Err(ModemError::NoCoverage.into())
    }

    async fn close(&self) {
        self.link.close().await;
    }
}
