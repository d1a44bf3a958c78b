//! cryptosense-core: Shared types and wire contract for CryptoSense.
//!
//! This crate provides the foundational types used by the sensor and the
//! manager:
//! - Discovery records produced by the fingerprint engine
//! - Health, command and registration messages exchanged over HTTP/JSON
//! - Deployment profiles and their feature defaults
//! - Common error types

pub mod error;
pub mod profile;
pub mod types;
pub mod wire;

pub use error::CoreError;
pub use profile::{features, DeploymentProfile, FeatureFlags};
pub use types::{Confidence, CryptoProtocol, Discovery, DiscoveryId, DiscoveryMethod};
