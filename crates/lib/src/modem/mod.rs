//! Cellular modem link: the boundary between the gateway and the modem hardware.
//!
//! A link emits inbound messages into the gateway's inbound channel and sends
//! outbound SMS. The serial implementation (AT commands, PDU mode) is behind the
//! `serial` feature; the PDU codec is always available.

pub mod pdu;
#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{clear_messages, modem_info, SerialModem, StoredSms};

use crate::channels::InboundMessage;
use crate::config::ModemConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("modem i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("modem did not answer {0} in time")]
    Timeout(String),
    #[error("modem rejected {command}: {response}")]
    Command { command: String, response: String },
    #[error("no network coverage")]
    NoCoverage,
    #[error("pdu: {0}")]
    Pdu(#[from] pdu::PduError),
    #[error("modem link closed")]
    Closed,
    #[error("serial modem support not built (enable the `serial` feature)")]
    Unsupported,
}

/// Connected modem.
#[async_trait]
pub trait ModemLink: Send + Sync {
    /// Channel name of this modem.
    fn name(&self) -> &str;

    /// Send one SMS (split into concatenated parts when needed).
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ModemError>;

    /// Wait up to `timeout` for network registration. Ok(false) means no coverage.
    async fn wait_for_coverage(&self, timeout: Duration) -> Result<bool, ModemError>;

    /// Stop emitting inbound messages. Sending keeps working until `close`.
    fn stop(&self);

    /// Release the device.
    async fn close(&self);
}

/// Connect the modem described by `config`; inbound messages go to `inbound_tx`.
#[cfg(feature = "serial")]
pub async fn connect(
    config: &ModemConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<Arc<dyn ModemLink>, ModemError> {
    let config = config.clone();
    let modem = tokio::task::spawn_blocking(move || SerialModem::open(&config, inbound_tx))
        .await
        .map_err(|_| ModemError::Closed)??;
    Ok(Arc::new(modem))
}

#[cfg(not(feature = "serial"))]
pub async fn connect(
    config: &ModemConfig,
    _inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<Arc<dyn ModemLink>, ModemError> {
    log::debug!("modem {}: built without serial support", config.name);
    Err(ModemError::Unsupported)
}
