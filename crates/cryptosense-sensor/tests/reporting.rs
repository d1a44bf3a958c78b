//! Sensor against a live manager on an ephemeral local port.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use etherparse::PacketBuilder;
use parking_lot::Mutex;

use cryptosense_core::wire::{AckStatus, Command, CommandType, CreatePendingRequest};
use cryptosense_core::{CryptoProtocol, DeploymentProfile, Discovery, DiscoveryMethod};
use cryptosense_manager::{routes, CertificateAuthority, ControlPlane, ManagerConfig};
use cryptosense_sensor::backend::{CaptureBackend, FrameSource, ReadOutcome};
use cryptosense_sensor::capture::CaptureError;
use cryptosense_sensor::client::OutboundClient;
use cryptosense_sensor::config::CaptureConfig;
use cryptosense_sensor::frame::LinkKind;
use cryptosense_sensor::health::{HealthCounters, HealthSampler};
use cryptosense_sensor::reporter::{upload_export, Reporter, EXPORT_DIR};
use cryptosense_sensor::{agent, commands, Agent, SensorConfig, SensorIdentity};
use cryptosense_store::{EncryptedStore, StoreConfig};

fn manager() -> (Arc<ControlPlane>, String) {
    let state = Arc::new(ControlPlane::new(
        ManagerConfig {
            tenant_id: "T".into(),
            ..Default::default()
        },
        CertificateAuthority::generate().unwrap(),
    ));
    let (addr, server) = warp::serve(routes(state.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (state, format!("http://{addr}"))
}

fn discovery(sensor_id: &str, port: u16) -> Discovery {
    Discovery::new(
        sensor_id,
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        port,
        CryptoProtocol::Tls,
        DiscoveryMethod::Passive,
    )
}

fn reporter(sensor_id: &str, store: Arc<EncryptedStore>, base: &str, dir: &Path) -> Reporter {
    Reporter {
        sensor_id: sensor_id.to_string(),
        store,
        client: OutboundClient::new(base, Duration::from_secs(2), None).unwrap(),
        counters: Arc::new(HealthCounters::new()),
        sampler: Arc::new(Mutex::new(HealthSampler::new())),
        batch_size: 2,
        air_gapped: false,
        export_dir: dir.join(EXPORT_DIR),
    }
}

async fn registered(
    state: &ControlPlane,
    base: &str,
    dir: &Path,
    profile: DeploymentProfile,
) -> (SensorConfig, SensorIdentity) {
    let pending = state
        .create_pending(CreatePendingRequest {
            name: "edge-1".into(),
            ip_address: "127.0.0.1".into(),
            profile,
            network_interfaces: vec!["scripted0".into()],
            tags: vec![],
        })
        .unwrap()
        .pending_sensor;

    let config = SensorConfig {
        name: "edge-1".into(),
        profile,
        control_plane_url: base.to_string(),
        registration_key: Some(pending.registration_key),
        ip_address: Some("127.0.0.1".into()),
        storage: StoreConfig::at(dir),
        capture: CaptureConfig {
            interfaces: vec!["scripted0".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let identity = agent::register(&config).await.unwrap();
    (config, identity)
}

#[tokio::test]
async fn registration_persists_identity() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let (config, identity) =
        registered(&state, &base, dir.path(), DeploymentProfile::DatacenterHost).await;

    assert!(!identity.sensor_id.is_empty());
    assert_eq!(identity.tenant_id, "T");
    assert_eq!(identity.reporting_interval, 30);
    assert!(identity.client_cert.contains("BEGIN CERTIFICATE"));
    assert_eq!(identity.server_ca_cert, state.ca().cert_pem());

    let saved = SensorIdentity::load(dir.path()).unwrap().unwrap();
    assert_eq!(saved.sensor_id, identity.sensor_id);

    // A saved identity short-circuits registration, so the used key is
    // never presented again.
    let again = agent::ensure_identity(&config).await.unwrap();
    assert_eq!(again.sensor_id, identity.sensor_id);

    let err = agent::register(&config).await.unwrap_err();
    assert!(err.to_string().contains("key_used"));
}

#[tokio::test]
async fn submitted_discoveries_leave_the_buffer() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EncryptedStore::open(StoreConfig::at(dir.path())).unwrap());
    let reporter = reporter("s1", store.clone(), &base, dir.path());

    for port in 0..5 {
        store.append(discovery("s1", 443 + port)).unwrap();
    }
    assert_eq!(store.pending_len(), 5);

    assert_eq!(reporter.submit_pending().await.unwrap(), 5);
    assert_eq!(store.pending_len(), 0);
    assert_eq!(state.sensor("s1").unwrap().discoveries_received, 5);
}

#[tokio::test]
async fn failed_submission_keeps_discoveries() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EncryptedStore::open(StoreConfig::at(dir.path())).unwrap());

    let mut offline = reporter("s1", store.clone(), "http://127.0.0.1:9", dir.path());
    for port in 0..3 {
        store.append(discovery("s1", 443 + port)).unwrap();
    }
    assert!(offline.submit_pending().await.is_err());
    assert_eq!(store.pending_len(), 3);

    for port in 3..5 {
        store.append(discovery("s1", 443 + port)).unwrap();
    }
    assert_eq!(store.pending_len(), 5);

    offline.client = OutboundClient::new(&base, Duration::from_secs(2), None).unwrap();
    assert_eq!(offline.submit_pending().await.unwrap(), 5);
    assert_eq!(store.pending_len(), 0);
    assert_eq!(state.sensor("s1").unwrap().discoveries_received, 5);
}

#[tokio::test]
async fn heartbeat_delivers_commands_until_acked() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EncryptedStore::open(StoreConfig::at(dir.path())).unwrap());
    let reporter = reporter("s1", store, &base, dir.path());

    let queued = state.enqueue_command("s1", Command::new(CommandType::StopCapture));
    let delivered = reporter.cycle(true).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, queued.id);

    let health = state.sensor("s1").unwrap().last_health.unwrap();
    assert!(health.metrics.contains_key("capture_running"));

    let response = commands::ack(&delivered[0], "s1", AckStatus::Processed, "");
    reporter.client.acknowledge(&response).await.unwrap();
    assert!(state.poll("s1").commands.is_empty());

    // Acknowledging twice is an error the sensor only logs.
    assert!(reporter.client.acknowledge(&response).await.is_err());
}

#[tokio::test]
async fn air_gapped_export_uploads_later() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EncryptedStore::open(StoreConfig::at(dir.path())).unwrap());
    let mut reporter = reporter("s1", store.clone(), &base, dir.path());
    reporter.air_gapped = true;

    for port in 0..3 {
        store.append(discovery("s1", 443 + port)).unwrap();
    }
    let path = reporter.export_pending().unwrap().unwrap();
    assert_eq!(store.pending_len(), 0);

    let receipt = upload_export(&reporter.client, &path).await.unwrap();
    assert_eq!(receipt.status, "received");
    assert_eq!(receipt.records, 3);
    assert_eq!(state.sensor("s1").unwrap().exports_received, 1);
}

// ── Agent ─────────────────────────────────────────────────────────

struct OneShotBackend {
    frames: Vec<Vec<u8>>,
}

struct OneShotSource {
    frames: VecDeque<Vec<u8>>,
}

impl CaptureBackend for OneShotBackend {
    fn interfaces(&self) -> Result<Vec<String>, CaptureError> {
        Ok(vec!["scripted0".into()])
    }

    fn open(
        &self,
        _interface: &str,
        _config: &CaptureConfig,
    ) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(OneShotSource {
            frames: self.frames.clone().into(),
        }))
    }
}

impl FrameSource for OneShotSource {
    fn link(&self) -> LinkKind {
        LinkKind::Ethernet
    }

    fn set_filter(&mut self, _expr: &str) -> Result<(), CaptureError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<ReadOutcome, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(ReadOutcome::Frame(frame)),
            None => {
                std::thread::sleep(Duration::from_millis(10));
                Ok(ReadOutcome::Timeout)
            }
        }
    }
}

fn ssh_banner_frame() -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4([10, 0, 0, 7], [10, 0, 0, 8], 64)
        .tcp(22, 51000, 1, 64240);
    let payload = b"SSH-2.0-OpenSSH_9.6\r\n";
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

#[tokio::test]
async fn agent_reports_then_stops_on_command() {
    let (state, base) = manager();
    let dir = tempfile::tempdir().unwrap();
    let (config, mut identity) =
        registered(&state, &base, dir.path(), DeploymentProfile::EndUserMachine).await;
    identity.reporting_interval = 1;
    identity.control_plane_url = base.clone();

    state.enqueue_command(&identity.sensor_id, Command::new(CommandType::Stop));
    let backend = Arc::new(OneShotBackend {
        frames: vec![ssh_banner_frame()],
    });
    let sensor_id = identity.sensor_id.clone();
    let agent = Agent::new(config, identity, backend).unwrap();

    tokio::time::timeout(Duration::from_secs(15), agent.run())
        .await
        .expect("agent did not stop")
        .unwrap();

    let record = state.sensor(&sensor_id).unwrap();
    assert_eq!(record.discoveries_received, 1);
    assert!(record.last_heartbeat.is_some());
    assert!(state.poll(&sensor_id).commands.is_empty());

    let received = state.recent_discoveries(&sensor_id);
    assert_eq!(received[0].protocol, CryptoProtocol::Ssh);
    assert_eq!(received[0].port, 22);
}
