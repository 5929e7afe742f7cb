//! SMS gateway core library: modem link, multipart reassembly, rule dispatch,
//! per-channel delivery workers and the gateway coordinator used by the CLI.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod modem;
pub mod multipart;
pub mod routing;
pub mod store;
