//! Tunnel configuration
//!
//! This module builds and parses the wg-quick style text handed to the OS tunnel host.

mod parser;

pub use parser::{TunnelConfig, DEFAULT_ALLOWED_IPS, DEFAULT_DNS, DEFAULT_KEEPALIVE};
