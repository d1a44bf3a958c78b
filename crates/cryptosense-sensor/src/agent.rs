//! Sensor control loop.
//!
//! Wires capture, storage, probing and reporting together and applies
//! remote commands. Everything runs on one `select!` loop; the reporting
//! cycle is spawned so a slow control plane never delays ingestion.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

use cryptosense_core::features;
use cryptosense_core::wire::{AckStatus, Command, RegistrationRequest};
use cryptosense_core::Discovery;
use cryptosense_store::EncryptedStore;

use crate::backend::CaptureBackend;
use crate::capture::{CaptureError, CaptureManager, CaptureStreams};
use crate::client::OutboundClient;
use crate::commands::{self, Directive};
use crate::config::SensorConfig;
use crate::error::{Result, SensorError};
use crate::fingerprint::FingerprintPolicy;
use crate::health::{HealthCounters, HealthSampler};
use crate::identity::SensorIdentity;
use crate::prober::ActiveProber;
use crate::reporter::{Reporter, EXPORT_DIR};

/// Receivers of the current capture run; `None` once closed or stopped.
#[derive(Default)]
struct LiveStreams {
    discoveries: Option<mpsc::Receiver<Discovery>>,
    errors: Option<mpsc::Receiver<CaptureError>>,
}

impl From<CaptureStreams> for LiveStreams {
    fn from(s: CaptureStreams) -> Self {
        Self {
            discoveries: Some(s.discoveries),
            errors: Some(s.errors),
        }
    }
}

/// What the loop does after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Reporting interval changed or the pipeline restarted.
    Reschedule,
    Shutdown,
}

// ── Registration ──────────────────────────────────────────────────

/// Build a registration request from local configuration.
pub fn registration_request(config: &SensorConfig) -> Result<RegistrationRequest> {
    let registration_key = config
        .registration_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| SensorError::NotRegistered("no registration key configured".into()))?;
    let ip_address = config
        .ip_address
        .clone()
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| SensorError::Config("ip_address is required to register".into()))?;

    Ok(RegistrationRequest {
        registration_key,
        name: config.name.clone(),
        description: config.description.clone(),
        platform: config.platform.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        profile: config.profile,
        network_interfaces: config.capture.interfaces.clone(),
        ip_address,
        tags: config.tags.clone(),
    })
}

/// Register with the control plane and persist the issued identity.
pub async fn register(config: &SensorConfig) -> Result<SensorIdentity> {
    let request = registration_request(config)?;
    let client = OutboundClient::new(
        &config.control_plane_url,
        Duration::from_secs(config.reporting.request_timeout_secs),
        None,
    )?;
    let response = client.register(&request).await?;
    let identity = SensorIdentity::from(response);
    identity.save(&config.storage.data_path)?;
    Ok(identity)
}

/// Load the saved identity, registering first if there is none.
pub async fn ensure_identity(config: &SensorConfig) -> Result<SensorIdentity> {
    if let Some(identity) = SensorIdentity::load(&config.storage.data_path)? {
        return Ok(identity);
    }
    tracing::info!(name = %config.name, "No saved identity, registering");
    register(config).await
}

// ── Agent ─────────────────────────────────────────────────────────

pub struct Agent {
    config: SensorConfig,
    identity: SensorIdentity,
    store: Arc<EncryptedStore>,
    client: OutboundClient,
    capture: CaptureManager,
    prober: Option<Arc<ActiveProber>>,
    counters: Arc<HealthCounters>,
    sampler: Arc<Mutex<HealthSampler>>,
    /// Probe and acknowledgement tasks, joined at shutdown.
    background: JoinSet<()>,
}

impl Agent {
    /// Build the pipeline. Defaults issued at registration take precedence
    /// over local configuration.
    pub fn new(
        mut config: SensorConfig,
        identity: SensorIdentity,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self> {
        if identity.reporting_interval > 0 {
            config.reporting.interval_secs = identity.reporting_interval;
        }
        for (name, enabled) in &identity.features {
            config.features.insert(name.clone(), *enabled);
        }
        if !identity.control_plane_url.is_empty() {
            config.control_plane_url = identity.control_plane_url.clone();
        }
        config.validate()?;

        let client = OutboundClient::new(
            &config.control_plane_url,
            Duration::from_secs(config.reporting.request_timeout_secs),
            Some(&identity),
        )?;
        let store = Arc::new(EncryptedStore::open(config.storage.clone())?);
        let counters = Arc::new(HealthCounters::new());
        let policy = FingerprintPolicy::from_features(&config.features);
        let capture = CaptureManager::new(
            backend,
            config.capture.clone(),
            identity.sensor_id.clone(),
            policy,
            counters.clone(),
        );

        let mut agent = Self {
            config,
            identity,
            store,
            client,
            capture,
            prober: None,
            counters,
            sampler: Arc::new(Mutex::new(HealthSampler::new())),
            background: JoinSet::new(),
        };
        agent.rebuild_prober();
        Ok(agent)
    }

    pub fn sensor_id(&self) -> &str {
        &self.identity.sensor_id
    }

    pub fn store(&self) -> &Arc<EncryptedStore> {
        &self.store
    }

    fn rebuild_prober(&mut self) {
        self.prober = self.config.probing_enabled().then(|| {
            Arc::new(ActiveProber::new(
                self.identity.sensor_id.clone(),
                &self.config.capture,
                FingerprintPolicy::from_features(&self.config.features),
                self.counters.clone(),
            ))
        });
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            sensor_id: self.identity.sensor_id.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
            counters: self.counters.clone(),
            sampler: self.sampler.clone(),
            batch_size: self.config.reporting.batch_size,
            air_gapped: self.config.feature(features::AIR_GAPPED_EXPORT),
            export_dir: self.config.storage.data_path.join(EXPORT_DIR),
        }
    }

    fn reporting_timer(&self) -> Interval {
        let period = Duration::from_secs(self.config.reporting.interval_secs.max(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    /// Run until SIGINT/SIGTERM or a `stop` command. Fails only when
    /// capture cannot start at all.
    pub async fn run(mut self) -> Result<()> {
        let mut streams = LiveStreams::from(self.capture.start()?);
        let (probe_tx, mut probe_rx) = mpsc::channel::<Discovery>(self.config.capture.queue_size);
        let (cycle_tx, mut cycle_rx) = mpsc::channel::<Vec<Command>>(4);

        let mut report = self.reporting_timer();
        let mut cleanup = interval(Duration::from_secs(
            self.config.reporting.cleanup_interval_secs.max(1),
        ));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inflight: Option<JoinHandle<()>> = None;

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        tracing::info!(
            sensor_id = %self.identity.sensor_id,
            interval_secs = self.config.reporting.interval_secs,
            probing = self.prober.is_some(),
            "Sensor running"
        );

        loop {
            let flow = tokio::select! {
                next = recv_or_pending(&mut streams.discoveries) => match next {
                    Some(d) => {
                        self.ingest(d, &probe_tx);
                        Flow::Continue
                    }
                    None => {
                        tracing::warn!("Capture streams closed, stopping capture");
                        self.stop_capture(&mut streams, &probe_tx).await;
                        Flow::Continue
                    }
                },
                next = recv_or_pending(&mut streams.errors) => {
                    match next {
                        Some(e) => tracing::warn!(error = %e, "Capture error"),
                        None => streams.errors = None,
                    }
                    Flow::Continue
                }
                Some(d) = probe_rx.recv() => {
                    self.ingest(d, &probe_tx);
                    Flow::Continue
                }
                _ = report.tick() => {
                    if inflight.as_ref().is_some_and(|h| !h.is_finished()) {
                        tracing::info!("Previous reporting cycle still running, skipping tick");
                    } else {
                        if let Some(prober) = &self.prober {
                            prober.reset_window();
                        }
                        let reporter = self.reporter();
                        let capture_running = self.capture.is_running();
                        let tx = cycle_tx.clone();
                        inflight = Some(tokio::spawn(async move {
                            let commands = reporter.cycle(capture_running).await;
                            if !commands.is_empty() {
                                let _ = tx.send(commands).await;
                            }
                        }));
                    }
                    Flow::Continue
                }
                Some(commands) = cycle_rx.recv() => {
                    self.handle_commands(commands, &mut streams, &probe_tx).await
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.store.cleanup() {
                        tracing::warn!(error = %e, "Storage cleanup failed");
                    }
                    Flow::Continue
                }
                Some(joined) = self.background.join_next(), if !self.background.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Background task panicked");
                    }
                    Flow::Continue
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    Flow::Shutdown
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Reschedule => report = self.reporting_timer(),
                Flow::Shutdown => break,
            }
        }

        if let Some(handle) = inflight.take() {
            let _ = handle.await;
        }
        self.shutdown(&mut streams, probe_tx, probe_rx).await
    }

    /// Persist a discovery and queue probes for the endpoint it names.
    fn ingest(&mut self, discovery: Discovery, probe_tx: &mpsc::Sender<Discovery>) {
        let targets = self
            .prober
            .as_ref()
            .map(|p| p.targets_for(&discovery))
            .unwrap_or_default();

        if let Err(e) = self.store.append(discovery) {
            self.counters.error();
            tracing::warn!(error = %e, "Failed to persist discovery, kept in memory");
        }
        if let (Some(prober), false) = (&self.prober, targets.is_empty()) {
            prober.spawn_probes(targets, probe_tx, &mut self.background);
        }
    }

    async fn stop_capture(
        &mut self,
        streams: &mut LiveStreams,
        probe_tx: &mpsc::Sender<Discovery>,
    ) {
        self.capture.stop().await;
        if let Some(mut rx) = streams.discoveries.take() {
            while let Ok(d) = rx.try_recv() {
                self.ingest(d, probe_tx);
            }
        }
        streams.errors = None;
    }

    fn start_capture(
        &mut self,
        streams: &mut LiveStreams,
    ) -> std::result::Result<(), CaptureError> {
        *streams = LiveStreams::from(self.capture.start()?);
        Ok(())
    }

    async fn handle_commands(
        &mut self,
        commands: Vec<Command>,
        streams: &mut LiveStreams,
        probe_tx: &mpsc::Sender<Discovery>,
    ) -> Flow {
        let mut flow = Flow::Continue;
        for command in commands {
            tracing::info!(command_id = %command.id, kind = %command.kind, "Processing command");

            let (status, message, next) = match commands::interpret(&command) {
                Ok(directive) => match self.apply(directive, streams, probe_tx).await {
                    Ok(next) => (AckStatus::Processed, String::new(), next),
                    Err(e) => {
                        tracing::error!(command_id = %command.id, error = %e, "Command failed");
                        (AckStatus::Failed, e.to_string(), Flow::Continue)
                    }
                },
                Err(e) => {
                    tracing::warn!(command_id = %command.id, error = %e, "Ignoring command");
                    (AckStatus::Ignored, e.to_string(), Flow::Continue)
                }
            };

            if command.requires_ack {
                let ack = commands::ack(&command, &self.identity.sensor_id, status, message);
                let client = self.client.clone();
                self.background.spawn(async move {
                    if let Err(e) = client.acknowledge(&ack).await {
                        tracing::warn!(command_id = %ack.command_id, error = %e, "Failed to acknowledge command");
                    }
                });
            }

            match next {
                Flow::Shutdown => return Flow::Shutdown,
                Flow::Reschedule => flow = Flow::Reschedule,
                Flow::Continue => {}
            }
        }
        flow
    }

    async fn apply(
        &mut self,
        directive: Directive,
        streams: &mut LiveStreams,
        probe_tx: &mpsc::Sender<Discovery>,
    ) -> Result<Flow> {
        match directive {
            Directive::Reconfigure(update) => {
                let before = self.config.reporting.interval_secs;
                self.config.apply(&update);
                if let Some(storage) = &update.storage {
                    self.store.reconfigure(storage);
                }
                self.capture
                    .set_policy(FingerprintPolicy::from_features(&self.config.features));
                self.capture.set_config(self.config.capture.clone());
                self.rebuild_prober();

                tracing::info!(
                    interval_secs = self.config.reporting.interval_secs,
                    probing = self.prober.is_some(),
                    "Configuration updated"
                );
                Ok(if self.config.reporting.interval_secs != before {
                    Flow::Reschedule
                } else {
                    Flow::Continue
                })
            }
            Directive::Restart => {
                tracing::info!("Restarting pipeline");
                self.stop_capture(streams, probe_tx).await;
                self.capture.set_config(self.config.capture.clone());
                self.rebuild_prober();
                self.start_capture(streams)?;
                Ok(Flow::Reschedule)
            }
            Directive::Shutdown => Ok(Flow::Shutdown),
            Directive::StartCapture => {
                self.start_capture(streams)?;
                Ok(Flow::Continue)
            }
            Directive::StopCapture => {
                self.stop_capture(streams, probe_tx).await;
                Ok(Flow::Continue)
            }
        }
    }

    /// Stop capture, wait for probes and acks, make a last submission
    /// attempt and close the store.
    async fn shutdown(
        mut self,
        streams: &mut LiveStreams,
        probe_tx: mpsc::Sender<Discovery>,
        mut probe_rx: mpsc::Receiver<Discovery>,
    ) -> Result<()> {
        // No new probes once capture is down.
        self.prober = None;
        self.stop_capture(streams, &probe_tx).await;
        drop(probe_tx);

        while let Some(joined) = self.background.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        while let Ok(d) = probe_rx.try_recv() {
            if let Err(e) = self.store.append(d) {
                tracing::warn!(error = %e, "Failed to persist probe result");
            }
        }

        let reporter = self.reporter();
        if reporter.air_gapped {
            if let Err(e) = reporter.export_pending() {
                tracing::error!(error = %e, "Final export failed");
            }
        } else if let Err(e) = reporter.submit_pending().await {
            tracing::warn!(
                error = %e,
                pending = self.store.pending_len(),
                "Final submission failed, pending discoveries remain on disk"
            );
        }

        self.store.close()?;
        tracing::info!(sensor_id = %self.identity.sensor_id, "Sensor stopped");
        Ok(())
    }
}

/// Receive from `rx`, or wait forever when there is no receiver.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_requires_key_and_ip() {
        let mut config = SensorConfig::default();
        assert!(matches!(
            registration_request(&config),
            Err(SensorError::NotRegistered(_))
        ));

        config.registration_key = Some("REG-T-20250101-ABC123".into());
        assert!(matches!(
            registration_request(&config),
            Err(SensorError::Config(_))
        ));

        config.ip_address = Some("10.0.0.5".into());
        let request = registration_request(&config).unwrap();
        assert_eq!(request.registration_key, "REG-T-20250101-ABC123");
        assert_eq!(request.network_interfaces, vec!["eth0"]);
        assert_eq!(request.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn saved_identity_skips_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SensorConfig::default();
        config.storage.data_path = dir.path().to_path_buf();

        let identity = SensorIdentity {
            sensor_id: "s-9".into(),
            tenant_id: "t".into(),
            client_cert: String::new(),
            client_key: String::new(),
            server_ca_cert: String::new(),
            control_plane_url: "http://127.0.0.1:9".into(),
            reporting_interval: 60,
            features: Default::default(),
            registered_at: chrono::Utc::now(),
        };
        identity.save(dir.path()).unwrap();

        let loaded = ensure_identity(&config).await.unwrap();
        assert_eq!(loaded.sensor_id, "s-9");
    }

    // ── Command handling ──────────────────────────────────────────

    use std::sync::atomic::{AtomicUsize, Ordering};

    use cryptosense_core::wire::{CaptureUpdate, CommandType, ConfigUpdate, StorageUpdate};
    use cryptosense_manager::CertificateAuthority;

    use crate::backend::{FrameSource, ReadOutcome};
    use crate::config::CaptureConfig;
    use crate::frame::LinkKind;

    /// Backend whose sources never yield a frame. Counts opens.
    #[derive(Default)]
    struct IdleBackend {
        opened: AtomicUsize,
    }

    struct IdleSource;

    impl CaptureBackend for IdleBackend {
        fn interfaces(&self) -> std::result::Result<Vec<String>, CaptureError> {
            Ok(vec!["idle0".into()])
        }

        fn open(
            &self,
            _interface: &str,
            _config: &CaptureConfig,
        ) -> std::result::Result<Box<dyn FrameSource>, CaptureError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleSource))
        }
    }

    impl FrameSource for IdleSource {
        fn link(&self) -> LinkKind {
            LinkKind::Ethernet
        }

        fn set_filter(&mut self, _expr: &str) -> std::result::Result<(), CaptureError> {
            Ok(())
        }

        fn next_frame(&mut self) -> std::result::Result<ReadOutcome, CaptureError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(ReadOutcome::Timeout)
        }
    }

    fn idle_agent(dir: &std::path::Path) -> (Agent, Arc<IdleBackend>) {
        let issued = CertificateAuthority::generate()
            .unwrap()
            .issue_client("edge-1")
            .unwrap();
        let identity = SensorIdentity {
            sensor_id: "s-1".into(),
            tenant_id: "t".into(),
            client_cert: issued.cert_pem,
            client_key: issued.key_pem,
            server_ca_cert: String::new(),
            control_plane_url: "http://127.0.0.1:9".into(),
            reporting_interval: 30,
            features: Default::default(),
            registered_at: chrono::Utc::now(),
        };
        let mut config = SensorConfig::default();
        config.storage.data_path = dir.to_path_buf();
        config.capture.interfaces = vec!["idle0".into()];
        config.reporting.request_timeout_secs = 1;

        let backend = Arc::new(IdleBackend::default());
        let agent = Agent::new(config, identity, backend.clone()).unwrap();
        (agent, backend)
    }

    fn unacked(kind: CommandType) -> Command {
        Command {
            requires_ack: false,
            ..Command::new(kind)
        }
    }

    #[tokio::test]
    async fn capture_stops_and_restarts_on_command() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agent, backend) = idle_agent(dir.path());
        let mut streams = LiveStreams::from(agent.capture.start().unwrap());
        let (probe_tx, _probe_rx) = mpsc::channel(8);

        let flow = agent
            .handle_commands(vec![unacked(CommandType::StopCapture)], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(!agent.capture.is_running());
        assert!(streams.discoveries.is_none());

        let flow = agent
            .handle_commands(vec![unacked(CommandType::StartCapture)], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(agent.capture.is_running());
        assert!(streams.discoveries.is_some());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);

        // Starting twice fails the command but keeps the running capture.
        let flow = agent
            .handle_commands(vec![unacked(CommandType::StartCapture)], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(agent.capture.is_running());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);

        let flow = agent
            .handle_commands(vec![unacked(CommandType::Restart)], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Reschedule);
        assert!(agent.capture.is_running());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 3);

        agent.capture.stop().await;
    }

    #[tokio::test]
    async fn update_config_reaches_store_prober_and_timer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agent, _backend) = idle_agent(dir.path());
        let mut streams = LiveStreams::default();
        let (probe_tx, _probe_rx) = mpsc::channel(8);

        let update = ConfigUpdate {
            reporting_interval: Some(5),
            storage: Some(StorageUpdate {
                rotation_size: Some(2048),
                ..Default::default()
            }),
            capture: Some(CaptureUpdate {
                active_probing: Some(true),
                ..Default::default()
            }),
            features: [(features::ACTIVE_PROBING.to_string(), true)].into_iter().collect(),
        };
        let mut command = Command::update_config(&update).unwrap();
        command.requires_ack = false;

        let flow = agent
            .handle_commands(vec![command.clone()], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Reschedule);
        assert_eq!(agent.config.reporting.interval_secs, 5);
        assert_eq!(agent.store.config().rotation_size, 2048);
        assert!(agent.prober.is_some());

        // Same interval again: nothing to reschedule.
        let flow = agent
            .handle_commands(vec![command], &mut streams, &probe_tx)
            .await;
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn acks_do_not_block_command_handling() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agent, _backend) = idle_agent(dir.path());
        let mut streams = LiveStreams::default();
        let (probe_tx, _probe_rx) = mpsc::channel(8);

        let commands = vec![
            Command::new(CommandType::StopCapture),
            Command::new(CommandType::Unknown("reboot".into())),
            Command::new(CommandType::Stop),
        ];
        let flow = agent.handle_commands(commands, &mut streams, &probe_tx).await;
        assert_eq!(flow, Flow::Shutdown);
        assert_eq!(agent.background.len(), 3);

        // The control plane is unreachable; each ack fails and is only logged.
        while let Some(joined) = agent.background.join_next().await {
            joined.unwrap();
        }
    }
}
