//! Interface capture manager.
//!
//! ```text
//!  iface reader (blocking) ─┐
//!  iface reader (blocking) ─┼─► frame queue ─► N classify workers ─► discovery queue
//!  iface reader (blocking) ─┘     (bounded)                            (bounded)
//! ```
//!
//! Both queues drop new items when full: capture never blocks on a slow
//! consumer. Drops are counted and logged. A single watch channel carries
//! cancellation to every reader; workers exit once all readers are gone and
//! the frame queue is drained.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use cryptosense_core::{Discovery, DiscoveryMethod};

use crate::backend::{CaptureBackend, FrameSource, ReadOutcome};
use crate::config::CaptureConfig;
use crate::fingerprint::{self, FingerprintPolicy, CAPTURE_FILTER};
use crate::frame::{self, RawFrame};
use crate::health::HealthCounters;

const ERROR_QUEUE_SIZE: usize = 100;
/// Back-off after a failed read so a broken handle does not spin.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(200);
/// Log the first drop and then every Nth.
const DROP_LOG_EVERY: u64 = 1000;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capture interface could be opened")]
    NoInterfaces,

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Failed to open {interface}: {reason}")]
    Open { interface: String, reason: String },

    #[error("Failed to install capture filter on {interface}: {reason}")]
    Filter { interface: String, reason: String },

    #[error("Read failed on {interface}: {reason}")]
    Read { interface: String, reason: String },

    #[error("Capture backend error: {0}")]
    Backend(String),

    #[error("Capture is already running")]
    AlreadyRunning,
}

/// Streams produced by one capture run. Both close once the run stops.
#[derive(Debug)]
pub struct CaptureStreams {
    pub discoveries: mpsc::Receiver<Discovery>,
    pub errors: mpsc::Receiver<CaptureError>,
    /// Interfaces that were opened.
    pub interfaces: Vec<String>,
}

struct Running {
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    interfaces: Vec<String>,
}

/// Owns capture handles and the classification pipeline.
pub struct CaptureManager {
    backend: Arc<dyn CaptureBackend>,
    config: CaptureConfig,
    sensor_id: String,
    policy: Arc<RwLock<FingerprintPolicy>>,
    counters: Arc<HealthCounters>,
    running: Option<Running>,
}

impl CaptureManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: CaptureConfig,
        sensor_id: impl Into<String>,
        policy: FingerprintPolicy,
        counters: Arc<HealthCounters>,
    ) -> Self {
        Self {
            backend,
            config,
            sensor_id: sensor_id.into(),
            policy: Arc::new(RwLock::new(policy)),
            counters,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Interfaces captured by the current run.
    pub fn interfaces(&self) -> Vec<String> {
        self.running
            .as_ref()
            .map(|r| r.interfaces.clone())
            .unwrap_or_default()
    }

    /// Change which analyses run. Applies to frames classified from now on.
    pub fn set_policy(&self, policy: FingerprintPolicy) {
        *self.policy.write() = policy;
    }

    /// Replace the capture settings used by the next [`start`](Self::start).
    pub fn set_config(&mut self, config: CaptureConfig) {
        self.config = config;
    }

    /// Open every configured interface that exists and start the pipeline.
    ///
    /// Interfaces that are missing or fail to open are skipped with a
    /// warning; only a run with no open interface is an error.
    pub fn start(&mut self) -> Result<CaptureStreams, CaptureError> {
        if self.running.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let sources = self.open_sources()?;
        let interfaces: Vec<String> = sources.iter().map(|(name, _)| name.clone()).collect();

        let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(self.config.frame_queue_size);
        let (disc_tx, disc_rx) = mpsc::channel::<Discovery>(self.config.queue_size);
        let (err_tx, err_rx) = mpsc::channel::<CaptureError>(ERROR_QUEUE_SIZE);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for (name, source) in sources {
            let frame_tx = frame_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel_rx.clone();
            let counters = self.counters.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                read_loop(name, source, frame_tx, err_tx, cancel, counters)
            }));
        }
        // Workers see the frame queue close once every reader has exited.
        drop(frame_tx);
        drop(err_tx);

        let frame_rx = Arc::new(Mutex::new(frame_rx));
        let workers = self.config.worker_count();
        for worker_id in 0..workers {
            let ctx = WorkerContext {
                sensor_id: self.sensor_id.clone(),
                policy: self.policy.clone(),
                counters: self.counters.clone(),
            };
            let frame_rx = frame_rx.clone();
            let disc_tx = disc_tx.clone();
            tasks.push(tokio::spawn(async move {
                classify_loop(worker_id, ctx, frame_rx, disc_tx).await
            }));
        }

        tracing::info!(
            interfaces = ?interfaces,
            workers,
            queue_size = self.config.queue_size,
            "Capture started"
        );

        self.running = Some(Running {
            cancel: cancel_tx,
            tasks,
            interfaces: interfaces.clone(),
        });

        Ok(CaptureStreams {
            discoveries: disc_rx,
            errors: err_rx,
            interfaces,
        })
    }

    fn open_sources(&self) -> Result<Vec<(String, Box<dyn FrameSource>)>, CaptureError> {
        let available = self.backend.interfaces()?;
        let mut sources = Vec::new();

        for name in &self.config.interfaces {
            if !available.iter().any(|a| a == name) {
                tracing::warn!(
                    interface = %name,
                    error = %CaptureError::InterfaceNotFound(name.clone()),
                    "Skipping interface"
                );
                continue;
            }

            let mut source = match self.backend.open(name, &self.config) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(interface = %name, error = %e, "Skipping interface");
                    continue;
                }
            };

            if let Err(e) = source.set_filter(CAPTURE_FILTER) {
                tracing::warn!(
                    interface = %name,
                    error = %e,
                    "Capture filter not installed, capturing unfiltered"
                );
            }
            sources.push((name.clone(), source));
        }

        if sources.is_empty() {
            return Err(CaptureError::NoInterfaces);
        }
        Ok(sources)
    }

    /// Signal cancellation, wait for every reader and worker to finish, and
    /// close the streams. Safe to call when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.cancel.send(true);

        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Capture task panicked");
            }
        }
        tracing::info!(interfaces = ?running.interfaces, "Capture stopped");
    }
}

/// Blocking loop reading one interface until cancelled or exhausted.
fn read_loop(
    interface: String,
    mut source: Box<dyn FrameSource>,
    frames: mpsc::Sender<RawFrame>,
    errors: mpsc::Sender<CaptureError>,
    cancel: watch::Receiver<bool>,
    counters: Arc<HealthCounters>,
) {
    let link = source.link();
    tracing::debug!(interface = %interface, link = ?link, "Reader started");

    while !*cancel.borrow() {
        match source.next_frame() {
            Ok(ReadOutcome::Frame(data)) => {
                counters.packet_captured();
                let frame = RawFrame {
                    interface: interface.clone(),
                    link,
                    data,
                };
                match frames.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = counters.frame_dropped();
                        if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                            tracing::warn!(
                                interface = %interface,
                                dropped,
                                "Frame queue full, dropping frame"
                            );
                        }
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::Closed) => {
                tracing::info!(interface = %interface, "Capture source closed");
                break;
            }
            Err(e) => {
                counters.error();
                tracing::warn!(interface = %interface, error = %e, "Capture read failed");
                let _ = errors.try_send(e);
                std::thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
    tracing::debug!(interface = %interface, "Reader exited");
}

struct WorkerContext {
    sensor_id: String,
    policy: Arc<RwLock<FingerprintPolicy>>,
    counters: Arc<HealthCounters>,
}

async fn classify_loop(
    worker_id: usize,
    ctx: WorkerContext,
    frames: Arc<Mutex<mpsc::Receiver<RawFrame>>>,
    discoveries: mpsc::Sender<Discovery>,
) {
    loop {
        let next = frames.lock().await.recv().await;
        let Some(frame) = next else {
            break;
        };

        let Some(segment) = frame::decode(frame.link, &frame.data) else {
            continue;
        };
        let policy = *ctx.policy.read();
        let Some(discovery) = fingerprint::classify(
            &segment,
            &frame.interface,
            &ctx.sensor_id,
            DiscoveryMethod::Passive,
            &policy,
        ) else {
            continue;
        };

        ctx.counters.discovery_made();
        tracing::trace!(
            protocol = %discovery.protocol,
            dest = %discovery.dest_ip,
            port = discovery.port,
            "Discovery"
        );
        match discoveries.try_send(discovery) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                let total = ctx.counters.discovery_dropped();
                if total == 1 || total % DROP_LOG_EVERY == 0 {
                    tracing::warn!(
                        discovery_id = %dropped.id,
                        dropped = total,
                        "Discovery queue full, dropping discovery"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    tracing::debug!(worker_id, "Classification worker exited");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};

    use crate::frame::tests::tcp_frame;
    use crate::frame::LinkKind;

    /// Frame sources scripted per interface.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub present: Vec<String>,
        pub frames: HashMap<String, Vec<Vec<u8>>>,
        pub fail_open: HashSet<String>,
        pub fail_filter: bool,
        /// Keep yielding timeouts after the script instead of closing.
        pub linger: bool,
    }

    struct ScriptedSource {
        frames: VecDeque<Vec<u8>>,
        fail_filter: bool,
        linger: bool,
    }

    impl CaptureBackend for ScriptedBackend {
        fn interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(self.present.clone())
        }

        fn open(
            &self,
            interface: &str,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn FrameSource>, CaptureError> {
            if self.fail_open.contains(interface) {
                return Err(CaptureError::Open {
                    interface: interface.to_string(),
                    reason: "permission denied".into(),
                });
            }
            Ok(Box::new(ScriptedSource {
                frames: self
                    .frames
                    .get(interface)
                    .cloned()
                    .unwrap_or_default()
                    .into(),
                fail_filter: self.fail_filter,
                linger: self.linger,
            }))
        }
    }

    impl FrameSource for ScriptedSource {
        fn link(&self) -> LinkKind {
            LinkKind::Ethernet
        }

        fn set_filter(&mut self, _expr: &str) -> Result<(), CaptureError> {
            if self.fail_filter {
                return Err(CaptureError::Filter {
                    interface: "scripted".into(),
                    reason: "bad filter".into(),
                });
            }
            Ok(())
        }

        fn next_frame(&mut self) -> Result<ReadOutcome, CaptureError> {
            match self.frames.pop_front() {
                Some(f) => Ok(ReadOutcome::Frame(f)),
                None if self.linger => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(ReadOutcome::Timeout)
                }
                None => Ok(ReadOutcome::Closed),
            }
        }
    }

    pub(crate) fn client_hello(last_octet: u8) -> Vec<u8> {
        tcp_frame(
            [10, 0, 0, last_octet],
            [10, 0, 1, 1],
            50000,
            443,
            &[0x16, 0x03, 0x03, 0x00, 0x30, 0x01],
        )
    }

    fn config(interfaces: &[&str], queue_size: usize) -> CaptureConfig {
        CaptureConfig {
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            queue_size,
            frame_queue_size: 1024,
            workers: Some(2),
            ..Default::default()
        }
    }

    fn manager(backend: ScriptedBackend, config: CaptureConfig) -> (CaptureManager, Arc<HealthCounters>) {
        let counters = Arc::new(HealthCounters::new());
        let m = CaptureManager::new(
            Arc::new(backend),
            config,
            "sensor-t",
            FingerprintPolicy::default(),
            counters.clone(),
        );
        (m, counters)
    }

    async fn drain(rx: &mut mpsc::Receiver<Discovery>) -> Vec<Discovery> {
        let mut out = Vec::new();
        while let Some(d) = rx.recv().await {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn start_fails_without_any_interface() {
        let backend = ScriptedBackend {
            present: vec!["lo".into()],
            ..Default::default()
        };
        let (mut m, _) = manager(backend, config(&["eth0", "eth1"], 10));
        assert!(matches!(m.start(), Err(CaptureError::NoInterfaces)));
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn partial_interface_failure_is_tolerated() {
        let backend = ScriptedBackend {
            present: vec!["eth0".into(), "eth2".into()],
            fail_open: ["eth2".to_string()].into(),
            fail_filter: true,
            frames: [("eth0".to_string(), vec![client_hello(1), client_hello(2)])].into(),
            ..Default::default()
        };
        let (mut m, counters) = manager(backend, config(&["eth0", "eth1", "eth2"], 10));
        let mut streams = m.start().unwrap();
        assert_eq!(streams.interfaces, vec!["eth0"]);

        // Scripted sources close once exhausted, which closes the stream.
        let found = drain(&mut streams.discoveries).await;
        m.stop().await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|d| d.raw_metadata["interface"] == "eth0"));
        assert_eq!(counters.snapshot().packets_captured, 2);
    }

    #[tokio::test]
    async fn saturated_queue_drops_instead_of_blocking() {
        let frames: Vec<Vec<u8>> = (1..=50).map(client_hello).collect();
        let backend = ScriptedBackend {
            present: vec!["eth0".into()],
            frames: [("eth0".to_string(), frames)].into(),
            ..Default::default()
        };
        let (mut m, counters) = manager(backend, config(&["eth0"], 1));
        let mut streams = m.start().unwrap();

        // Nobody reads discoveries until every frame has been classified.
        for _ in 0..500 {
            if counters.snapshot().discoveries_made == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        m.stop().await;
        let snap = counters.snapshot();
        assert_eq!(snap.discoveries_made, 50);
        assert_eq!(snap.discoveries_dropped, 49);
        assert_eq!(drain(&mut streams.discoveries).await.len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restart_works() {
        let backend = ScriptedBackend {
            present: vec!["eth0".into()],
            linger: true,
            ..Default::default()
        };
        let (mut m, _) = manager(backend, config(&["eth0"], 10));

        let mut first = m.start().unwrap();
        assert!(matches!(m.start(), Err(CaptureError::AlreadyRunning)));
        m.stop().await;
        m.stop().await;
        assert!(first.discoveries.recv().await.is_none());
        assert!(first.errors.recv().await.is_none());

        let _second = m.start().unwrap();
        assert!(m.is_running());
        m.stop().await;
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn non_crypto_frames_are_ignored() {
        let http = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 50000, 80, b"GET / HTTP/1.1");
        let backend = ScriptedBackend {
            present: vec!["eth0".into()],
            frames: [("eth0".to_string(), vec![http, vec![0u8; 3]])].into(),
            ..Default::default()
        };
        let (mut m, counters) = manager(backend, config(&["eth0"], 10));
        let mut streams = m.start().unwrap();
        assert!(drain(&mut streams.discoveries).await.is_empty());
        m.stop().await;
        assert_eq!(counters.snapshot().packets_captured, 2);
    }
}
