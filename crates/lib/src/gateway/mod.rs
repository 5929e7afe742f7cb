//! Gateway: wires modems, the inbound pipeline and the outbound channels together.
//!
//! Inbound messages flow modem link → reassembly → store → rule dispatch → channel
//! queues. A small HTTP server reports health and the retained messages.

mod pipeline;
mod server;
mod status;

pub use pipeline::Pipeline;
pub use server::{run_gateway, Gateway};
pub use status::{router as status_router, StatusState};
