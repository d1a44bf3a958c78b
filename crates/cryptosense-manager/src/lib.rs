//! cryptosense-manager: Control plane for CryptoSense sensors.
//!
//! Operators pre-issue single-use registration keys. Sensors redeem them
//! for an mTLS client certificate signed by the manager's own CA, then
//! report discoveries and health and pick up queued commands. All sensor
//! traffic is sensor-initiated HTTP/JSON.

pub mod ca;
pub mod commands;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;

pub use ca::CertificateAuthority;
pub use config::ManagerConfig;
pub use error::{ManagerError, RegistrationError, Result};
pub use registry::PendingRegistry;
pub use server::{routes, serve};
pub use service::ControlPlane;
