//! Outbound channels (modem SMS, email, HTTP API) and the inbound message types.
//!
//! Every channel owns one FIFO queue drained by one worker. Dispatch submits jobs by
//! channel name through the registry; workers retry failed jobs with exponential backoff.

mod api;
mod email;
mod error;
mod inbound;
mod queue;
mod registry;
mod retry;
mod sms;
mod worker;

pub use api::{ApiDelivery, HttpMethod};
pub use email::EmailDelivery;
pub use error::DeliveryError;
pub use inbound::{CompleteMessage, ConcatHeader, InboundMessage, MultipartInfo};
pub use queue::{JobQueue, OutboundJob};
pub use registry::{ChannelHandle, ChannelKind, ChannelRegistry};
pub use retry::RetryPolicy;
pub use sms::ModemDelivery;
pub use worker::{ChannelWorker, Delivery, JobOutcome};
