//! Manager configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use cryptosense_core::wire::AdminSettings;

use crate::error::{ManagerError, Result};

/// Control plane settings.
///
/// Loaded from the `[manager]` section of `cryptosense.toml` or
/// `CRYPTOSENSE_MANAGER__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Tenant embedded in registration keys and issued identities.
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// URL sensors are told to report to.
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,

    /// Directory persisting the certificate authority. Without one a fresh
    /// CA is generated on every start.
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Initial registration policy; adjustable at runtime.
    #[serde(default)]
    pub admin: AdminSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Serve HTTPS with optional client certificates.
    #[serde(default)]
    pub enabled: bool,

    /// Names on the server certificate issued from the CA when no
    /// certificate files are given.
    #[serde(default = "default_server_names")]
    pub server_names: Vec<String>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8085))
}

fn default_tenant_id() -> String {
    "tenant".to_string()
}

fn default_control_plane_url() -> String {
    "https://localhost:8085".to_string()
}

fn default_server_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_names: default_server_names(),
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tenant_id: default_tenant_id(),
            control_plane_url: default_control_plane_url(),
            ca_dir: None,
            tls: TlsConfig::default(),
            admin: AdminSettings::default(),
        }
    }
}

/// Load `[manager]` from `<file_prefix>.toml` (optional) and
/// `CRYPTOSENSE_MANAGER__*` environment variables.
pub fn load(file_prefix: &str) -> Result<ManagerConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("CRYPTOSENSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("manager.tls.server_names"),
        )
        .build()
        .map_err(|e| ManagerError::Config(e.to_string()))?;

    match cfg.get::<ManagerConfig>("manager") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(ManagerConfig::default()),
        Err(e) => Err(ManagerError::Config(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.listen.port(), 8085);
        assert_eq!(config.tenant_id, "tenant");
        assert_eq!(config.control_plane_url, "https://localhost:8085");
        assert!(config.ca_dir.is_none());
        assert!(!config.tls.enabled);
        assert_eq!(config.admin.key_expiration_minutes, 60);
        assert_eq!(config.admin.max_pending_sensors, 50);
        assert!(config.admin.require_ip_validation);
    }

    #[test]
    fn partial_section_uses_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"tenant_id": "acme", "tls": {"enabled": true}}"#).unwrap();
        assert_eq!(config.tenant_id, "acme");
        assert!(config.tls.enabled);
        assert_eq!(config.tls.server_names, vec!["localhost"]);
        assert_eq!(config.listen, default_listen());
    }
}
