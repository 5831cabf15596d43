//! Undertow tunnel client
//!
//! Asks an undertow server to open public ports and forwards every
//! connection arriving on them to a local TCP or UDP service.

pub mod client;
pub mod config;
pub mod forwarder;
pub mod tunnel;

pub use client::Client;
pub use config::{parse_forward_arg, ClientConfig, ForwardConfig, ResolvedClientConfig};
pub use forwarder::{ForwardError, ForwardSpec, ForwardState, ForwardUnit};
pub use tunnel::serve_exchange;
