//! Delivery errors shared by all channel kinds.

use crate::modem::ModemError;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Malformed destination; never retried.
    #[error("invalid destination: {0}")]
    Address(String),
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("delivery timed out")]
    Timeout,
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("modem error: {0}")]
    Modem(#[from] ModemError),
}

impl DeliveryError {
    /// Transient failures go back through the retry policy; validation failures do not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Address(_))
    }
}
