//! Active probing of endpoints seen on the wire.
//!
//! Passive discoveries name servers speaking TLS or SSH. When probing is
//! enabled the sensor dials those servers once per reporting window to
//! confirm the protocol from the server's own reply: the SSH identification
//! string, or the TLS record answering a canned ClientHello. With network
//! discovery on, the other well-known crypto ports of a known host are
//! tried as well.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use cryptosense_core::{CryptoProtocol, Discovery, DiscoveryMethod};

use crate::config::CaptureConfig;
use crate::fingerprint::{self, FingerprintPolicy, SSH_PORT, TLS_PORTS};
use crate::frame::TcpSegment;
use crate::health::HealthCounters;

/// Bytes read from a probed server.
const REPLY_LIMIT: usize = 4096;
/// Interface tag on actively produced discoveries.
const PROBE_INTERFACE: &str = "probe";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Connection timeout")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An endpoint to dial and the protocol expected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    pub addr: SocketAddr,
    pub protocol: CryptoProtocol,
}

impl ProbeTarget {
    pub fn new(ip: IpAddr, port: u16) -> Option<Self> {
        fingerprint::protocol_for_port(port).map(|protocol| Self {
            addr: SocketAddr::new(ip, port),
            protocol,
        })
    }
}

/// Active prober with a connection cap and a per-window dedup set.
pub struct ActiveProber {
    sensor_id: String,
    timeout: Duration,
    network_discovery: bool,
    max_connections: usize,
    policy: FingerprintPolicy,
    semaphore: Arc<Semaphore>,
    counters: Arc<HealthCounters>,
    seen: Mutex<HashSet<ProbeTarget>>,
}

impl ActiveProber {
    pub fn new(
        sensor_id: impl Into<String>,
        config: &CaptureConfig,
        policy: FingerprintPolicy,
        counters: Arc<HealthCounters>,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            sensor_id: sensor_id.into(),
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            network_discovery: config.network_discovery,
            max_connections,
            policy,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            counters,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Endpoints worth probing for a passive discovery that have not been
    /// probed in the current window. Active discoveries are never re-probed.
    pub fn targets_for(&self, discovery: &Discovery) -> Vec<ProbeTarget> {
        if discovery.discovery_method != DiscoveryMethod::Passive {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        candidates.extend(ProbeTarget::new(discovery.dest_ip, discovery.port));
        if self.network_discovery {
            candidates.extend(
                TLS_PORTS
                    .iter()
                    .chain(std::iter::once(&SSH_PORT))
                    .filter(|p| **p != discovery.port)
                    .filter_map(|p| ProbeTarget::new(discovery.dest_ip, *p)),
            );
        }

        let mut seen = self.seen.lock();
        candidates.retain(|t| seen.insert(*t));
        candidates
    }

    /// Forget which endpoints were probed so the next window probes again.
    pub fn reset_window(&self) {
        self.seen.lock().clear();
    }

    pub fn active_probes(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Probe `targets` on `tasks`, pushing confirmed discoveries to
    /// `results`. Targets over the connection cap are skipped for this
    /// window.
    pub fn spawn_probes(
        self: &Arc<Self>,
        targets: Vec<ProbeTarget>,
        results: &mpsc::Sender<Discovery>,
        tasks: &mut JoinSet<()>,
    ) {
        for target in targets {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                tracing::debug!(endpoint = %target.addr, error = %ProbeError::RateLimitExceeded, "Probe skipped");
                self.seen.lock().remove(&target);
                continue;
            };
            let prober = Arc::clone(self);
            let results = results.clone();
            tasks.spawn(async move {
                let outcome = prober.probe(target).await;
                drop(permit);
                match outcome {
                    Ok(Some(discovery)) => {
                        if results.try_send(discovery).is_err() {
                            prober.counters.discovery_dropped();
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(endpoint = %target.addr, "Probe got no usable reply");
                    }
                    Err(e) => {
                        tracing::debug!(endpoint = %target.addr, error = %e, "Probe failed");
                    }
                }
            });
        }
    }

    /// Dial one endpoint and classify what it says.
    pub async fn probe(&self, target: ProbeTarget) -> Result<Option<Discovery>, ProbeError> {
        self.counters.probe_sent();
        let mut stream = timeout(self.timeout, TcpStream::connect(target.addr))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        let local = stream.local_addr()?;

        if target.protocol == CryptoProtocol::Tls {
            stream.write_all(&client_hello()).await?;
        }

        let mut reply = vec![0u8; REPLY_LIMIT];
        let n = match timeout(self.timeout, stream.read(&mut reply)).await {
            Ok(read) => read?,
            Err(_) => return Err(ProbeError::Timeout),
        };
        reply.truncate(n);

        let segment = TcpSegment {
            src_ip: local.ip(),
            dst_ip: target.addr.ip(),
            src_port: local.port(),
            dst_port: target.addr.port(),
            frame_len: reply.len(),
            payload: reply,
        };
        let discovery = fingerprint::classify_as(
            &segment,
            target.addr.port(),
            target.protocol,
            PROBE_INTERFACE,
            &self.sensor_id,
            DiscoveryMethod::Active,
            &self.policy,
        );
        if let Some(d) = &discovery {
            self.counters.discovery_made();
            tracing::debug!(
                endpoint = %target.addr,
                protocol = %d.protocol,
                version = %d.protocol_version,
                "Probe confirmed endpoint"
            );
        }
        Ok(discovery)
    }
}

/// A TLS 1.2 ClientHello offering common suites, enough to make a server
/// answer with a ServerHello or an alert.
fn client_hello() -> Vec<u8> {
    const SUITES: [u8; 10] = [
        0x13, 0x01, // TLS_AES_128_GCM_SHA256
        0xc0, 0x2f, // ECDHE_RSA_AES_128_GCM_SHA256
        0xc0, 0x2b, // ECDHE_ECDSA_AES_128_GCM_SHA256
        0xc0, 0x30, // ECDHE_RSA_AES_256_GCM_SHA384
        0x00, 0x9c, // RSA_AES_128_GCM_SHA256
    ];

    let mut body = Vec::with_capacity(96);
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    body.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    body.push(0); // session id
    body.extend_from_slice(&(SUITES.len() as u16).to_be_bytes());
    body.extend_from_slice(&SUITES);
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&[0x00, 0x00]); // no extensions

    let mut handshake = Vec::with_capacity(body.len() + 4);
    handshake.push(0x01);
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::with_capacity(handshake.len() + 5);
    record.extend_from_slice(&[0x16, 0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
