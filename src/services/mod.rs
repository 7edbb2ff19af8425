//! Routing services: the provider registry, the resilience pipeline and
//! outbound upstream calls.

pub mod registry;
pub mod router;
pub mod upstream;
