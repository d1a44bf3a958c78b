//! Deployment profiles and feature flags.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Feature flag names understood by the sensor.
pub mod features {
    pub const TLS_ANALYSIS: &str = "tls_analysis";
    pub const SSH_ANALYSIS: &str = "ssh_analysis";
    pub const CERTIFICATE_ANALYSIS: &str = "certificate_analysis";
    pub const ACTIVE_PROBING: &str = "active_probing";
    pub const NETWORK_DISCOVERY: &str = "network_discovery";
    pub const AIR_GAPPED_EXPORT: &str = "air_gapped_export";

    pub const ALL: [&str; 6] = [
        TLS_ANALYSIS,
        SSH_ANALYSIS,
        CERTIFICATE_ANALYSIS,
        ACTIVE_PROBING,
        NETWORK_DISCOVERY,
        AIR_GAPPED_EXPORT,
    ];
}

/// Feature name → enabled.
pub type FeatureFlags = BTreeMap<String, bool>;

/// Where a sensor is deployed. Selects the default reporting interval and
/// feature set handed out at registration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentProfile {
    #[default]
    DatacenterHost,
    CloudInstance,
    EndUserMachine,
    AirGapped,
    #[serde(other)]
    Custom,
}

impl DeploymentProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatacenterHost => "datacenter_host",
            Self::CloudInstance => "cloud_instance",
            Self::EndUserMachine => "end_user_machine",
            Self::AirGapped => "air_gapped",
            Self::Custom => "custom",
        }
    }

    /// Parse a profile name. Unrecognised names are `Custom`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "datacenter_host" => Self::DatacenterHost,
            "cloud_instance" => Self::CloudInstance,
            "end_user_machine" => Self::EndUserMachine,
            "air_gapped" => Self::AirGapped,
            _ => Self::Custom,
        }
    }

    /// Default heartbeat/submission interval for this profile.
    pub fn reporting_interval_secs(&self) -> u64 {
        match self {
            Self::DatacenterHost => 30,
            Self::CloudInstance => 60,
            Self::EndUserMachine => 300,
            Self::AirGapped => 3600,
            Self::Custom => 60,
        }
    }

    /// Default feature set for this profile. Every known feature is present.
    pub fn default_features(&self) -> FeatureFlags {
        let mut flags: FeatureFlags = features::ALL
            .iter()
            .map(|name| (name.to_string(), false))
            .collect();
        for base in [
            features::TLS_ANALYSIS,
            features::SSH_ANALYSIS,
            features::CERTIFICATE_ANALYSIS,
        ] {
            flags.insert(base.to_string(), true);
        }

        let extra: &[&str] = match self {
            Self::DatacenterHost => &[features::ACTIVE_PROBING, features::NETWORK_DISCOVERY],
            Self::CloudInstance => &[features::ACTIVE_PROBING],
            Self::AirGapped => &[features::AIR_GAPPED_EXPORT],
            Self::EndUserMachine | Self::Custom => &[],
        };
        for name in extra {
            flags.insert(name.to_string(), true);
        }
        flags
    }
}

impl fmt::Display for DeploymentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
