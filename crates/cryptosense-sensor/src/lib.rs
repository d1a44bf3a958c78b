//! cryptosense-sensor: Network sensor for cryptographic protocol discovery.
//!
//! Captures traffic on configured interfaces, fingerprints TLS and SSH
//! handshakes, keeps every discovery in an encrypted rotating store and
//! reports to the control plane over outbound HTTPS only. Remote commands
//! arrive piggybacked on heartbeat responses.

pub mod agent;
pub mod backend;
pub mod capture;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod health;
pub mod identity;
pub mod prober;
pub mod reporter;

pub use agent::Agent;
pub use config::SensorConfig;
pub use error::{Result, SensorError};
pub use identity::SensorIdentity;
