//! Control plane state and operations, independent of the HTTP layer.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use cryptosense_core::wire::{
    AdminSettings, AirGappedExport, BatchReceipt, Command, CommandResponse, ConfigUpdate,
    CreatePendingRequest, CreatePendingResponse, DiscoveryBatch, ExportReceipt,
    PendingRegistration, RegistrationRequest, RegistrationResponse, SensorCommands, SensorHealth,
};
use cryptosense_core::{DeploymentProfile, Discovery};
use cryptosense_store::export;

use crate::ca::CertificateAuthority;
use crate::commands::CommandQueue;
use crate::config::ManagerConfig;
use crate::error::{ManagerError, RegistrationError, Result};
use crate::registry::PendingRegistry;

/// Discoveries kept per sensor for operator inspection.
const RECENT_DISCOVERIES: usize = 1000;

/// What the manager knows about a registered sensor.
#[derive(Debug, Clone, Serialize)]
pub struct SensorRecord {
    pub sensor_id: String,
    pub tenant_id: String,
    pub name: String,
    pub ip_address: String,
    pub profile: DeploymentProfile,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_health: Option<SensorHealth>,
    pub discoveries_received: u64,
    pub exports_received: u64,
    #[serde(skip)]
    pub recent: VecDeque<Discovery>,
}

impl SensorRecord {
    fn unregistered(sensor_id: &str, tenant_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: String::new(),
            ip_address: String::new(),
            profile: DeploymentProfile::Custom,
            registered_at: None,
            last_heartbeat: None,
            last_health: None,
            discoveries_received: 0,
            exports_received: 0,
            recent: VecDeque::new(),
        }
    }
}

pub struct ControlPlane {
    config: ManagerConfig,
    registry: PendingRegistry,
    ca: CertificateAuthority,
    commands: CommandQueue,
    sensors: Mutex<HashMap<String, SensorRecord>>,
}

impl ControlPlane {
    pub fn new(config: ManagerConfig, ca: CertificateAuthority) -> Self {
        let registry = PendingRegistry::new(config.tenant_id.clone(), config.admin.clone());
        Self {
            config,
            registry,
            ca,
            commands: CommandQueue::default(),
            sensors: Mutex::new(HashMap::new()),
        }
    }

    /// Build from configuration, loading or creating the CA.
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        let ca = CertificateAuthority::from_config(config.ca_dir.as_deref())?;
        Ok(Self::new(config, ca))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    // ── Registration ──────────────────────────────────────────────

    /// Redeem a registration key and issue the sensor its identity.
    pub fn register(
        &self,
        request: &RegistrationRequest,
        transport_ip: Option<IpAddr>,
    ) -> Result<RegistrationResponse> {
        let (response, pending) = self.registry.redeem(request, transport_ip, |pending| {
            let cert = self
                .ca
                .issue_client(&request.name)
                .map_err(|e| RegistrationError::Certificate(e.to_string()))?;
            let sensor_id = Uuid::new_v4().to_string();
            let profile = pending.profile;
            let features = profile.default_features();
            let reporting_interval = profile.reporting_interval_secs();

            let response = RegistrationResponse {
                sensor_id,
                tenant_id: self.config.tenant_id.clone(),
                client_cert: cert.cert_pem,
                client_key: cert.key_pem,
                server_ca_cert: self.ca.cert_pem().to_string(),
                control_plane_url: self.config.control_plane_url.clone(),
                reporting_interval,
                features: features.clone(),
                config: ConfigUpdate {
                    reporting_interval: Some(reporting_interval),
                    features,
                    ..Default::default()
                },
                message: format!("Sensor {} registered as {}", request.name, profile),
            };
            Ok::<_, ManagerError>((response, pending.clone()))
        })?;

        let record = SensorRecord {
            name: request.name.clone(),
            ip_address: pending.bound_ip.clone(),
            profile: pending.profile,
            registered_at: Some(Utc::now()),
            ..SensorRecord::unregistered(&response.sensor_id, &self.config.tenant_id)
        };
        self.sensors.lock().insert(response.sensor_id.clone(), record);

        tracing::info!(
            sensor_id = %response.sensor_id,
            name = %request.name,
            profile = %pending.profile,
            "Sensor registered"
        );
        Ok(response)
    }

    pub fn create_pending(&self, request: CreatePendingRequest) -> Result<CreatePendingResponse> {
        let pending = self.registry.create(request)?;
        let installation_command = installation_command(&self.config.control_plane_url, &pending);
        Ok(CreatePendingResponse {
            pending_sensor: pending,
            installation_command,
        })
    }

    pub fn list_pending(&self) -> Vec<PendingRegistration> {
        self.registry.list()
    }

    pub fn delete_pending(&self, key: &str) -> Result<PendingRegistration> {
        Ok(self.registry.delete(key)?)
    }

    pub fn settings(&self) -> AdminSettings {
        self.registry.settings()
    }

    pub fn update_settings(&self, settings: AdminSettings) -> Result<AdminSettings> {
        Ok(self.registry.update_settings(settings)?)
    }

    // ── Sensor traffic ────────────────────────────────────────────

    /// Record a heartbeat and hand back any queued commands.
    pub fn heartbeat(&self, sensor_id: &str, health: SensorHealth) -> Result<SensorCommands> {
        check_sensor_id(sensor_id, &health.sensor_id)?;
        {
            let mut sensors = self.sensors.lock();
            let record = sensors.entry(sensor_id.to_string()).or_insert_with(|| {
                tracing::warn!(sensor_id, "Heartbeat from unregistered sensor");
                SensorRecord::unregistered(sensor_id, &self.config.tenant_id)
            });
            record.last_heartbeat = Some(Utc::now());
            tracing::debug!(
                sensor_id,
                status = ?health.status,
                pending = health.pending_submissions,
                "Heartbeat"
            );
            record.last_health = Some(health);
        }
        Ok(self.poll(sensor_id))
    }

    pub fn submit_discoveries(&self, sensor_id: &str, batch: DiscoveryBatch) -> Result<BatchReceipt> {
        check_sensor_id(sensor_id, &batch.sensor_id)?;
        let accepted = batch.discoveries.len();
        if batch.count != accepted {
            tracing::warn!(
                sensor_id,
                batch_id = %batch.batch_id,
                declared = batch.count,
                actual = accepted,
                "Batch count does not match its contents"
            );
        }

        let mut sensors = self.sensors.lock();
        let record = sensors
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorRecord::unregistered(sensor_id, &self.config.tenant_id));
        record.discoveries_received += accepted as u64;
        for discovery in batch.discoveries {
            if record.recent.len() == RECENT_DISCOVERIES {
                record.recent.pop_front();
            }
            record.recent.push_back(discovery);
        }

        tracing::info!(sensor_id, batch_id = %batch.batch_id, accepted, "Discovery batch received");
        Ok(BatchReceipt {
            batch_id: batch.batch_id,
            accepted,
        })
    }

    /// Verify an air-gapped export's checksum and record its receipt. The
    /// payload stays encrypted under the sensor's local key.
    pub fn submit_export(&self, sensor_id: &str, upload: AirGappedExport) -> Result<ExportReceipt> {
        check_sensor_id(sensor_id, &upload.sensor_id)?;
        export::verify(&upload)?;

        let mut sensors = self.sensors.lock();
        let record = sensors
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorRecord::unregistered(sensor_id, &self.config.tenant_id));
        record.exports_received += 1;

        tracing::info!(
            sensor_id,
            export_id = %upload.export_id,
            records = upload.record_count,
            "Air-gapped export received"
        );
        Ok(ExportReceipt {
            status: "received".to_string(),
            export_id: upload.export_id,
            records: upload.record_count,
        })
    }

    pub fn poll(&self, sensor_id: &str) -> SensorCommands {
        SensorCommands {
            sensor_id: sensor_id.to_string(),
            commands: self.commands.take(sensor_id),
        }
    }

    pub fn acknowledge(&self, sensor_id: &str, command_id: &str, response: CommandResponse) -> Result<()> {
        check_sensor_id(sensor_id, &response.sensor_id)?;
        if response.command_id != command_id {
            return Err(ManagerError::UnknownCommand {
                sensor_id: sensor_id.to_string(),
                command_id: response.command_id,
            });
        }
        self.commands.acknowledge(sensor_id, &response)
    }

    pub fn enqueue_command(&self, sensor_id: &str, command: Command) -> Command {
        self.commands.enqueue(sensor_id, command.clone());
        command
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<SensorRecord> {
        self.sensors.lock().get(sensor_id).cloned()
    }

    pub fn sensors(&self) -> Vec<SensorRecord> {
        let mut out: Vec<_> = self.sensors.lock().values().cloned().collect();
        out.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        out
    }

    /// Most recent discoveries received from a sensor, oldest first.
    pub fn recent_discoveries(&self, sensor_id: &str) -> Vec<Discovery> {
        self.sensors
            .lock()
            .get(sensor_id)
            .map(|r| r.recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn check_sensor_id(path: &str, body: &str) -> Result<()> {
    if path != body {
        return Err(ManagerError::SensorIdMismatch {
            path: path.to_string(),
            body: body.to_string(),
        });
    }
    Ok(())
}

/// Shell snippet an operator runs on the sensor host to register it.
fn installation_command(control_plane_url: &str, pending: &PendingRegistration) -> String {
    let mut vars = vec![
        format!("CRYPTOSENSE_SENSOR__CONTROL_PLANE_URL={control_plane_url}"),
        format!("CRYPTOSENSE_SENSOR__REGISTRATION_KEY={}", pending.registration_key),
        format!("CRYPTOSENSE_SENSOR__NAME={}", pending.name),
        format!("CRYPTOSENSE_SENSOR__IP_ADDRESS={}", pending.bound_ip),
        format!("CRYPTOSENSE_SENSOR__PROFILE={}", pending.profile),
    ];
    if !pending.network_interfaces.is_empty() {
        vars.push(format!(
            "CRYPTOSENSE_SENSOR__CAPTURE__INTERFACES={}",
            pending.network_interfaces.join(",")
        ));
    }
    format!("{} cryptosense-sensor register", vars.join(" "))
}
