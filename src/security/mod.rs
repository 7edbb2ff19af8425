//! Transport security: inbound TLS, caller identity and the mutual-TLS
//! accept loop.

pub mod identity;
pub mod server;
pub mod tls;
