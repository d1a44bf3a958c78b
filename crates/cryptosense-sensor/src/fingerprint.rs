//! Protocol fingerprint engine.
//!
//! Turns a decoded TCP segment into a typed [`Discovery`] candidate. The
//! engine is a set of pure functions: bytes in, record out. It holds no
//! state and is safe to call from any number of workers.
//!
//! Only enough of each wire format is read to label the protocol version
//! and raise confidence as more handshake structure is confirmed:
//!
//! | Evidence                         | Confidence |
//! |----------------------------------|------------|
//! | Well-known port only             | 0.80       |
//! | TLS ClientHello / ServerHello    | 0.90       |
//! | SSH identification string        | 0.90       |
//! | TLS Certificate message          | 0.95       |

use cryptosense_core::{features, Confidence, CryptoProtocol, Discovery, DiscoveryMethod, FeatureFlags};

use crate::frame::TcpSegment;

/// Ports that carry TLS (HTTPS, IMAPS, POP3S, SMTPS, submission).
pub const TLS_PORTS: [u16; 5] = [443, 993, 995, 465, 587];
pub const SSH_PORT: u16 = 22;

/// Capture filter restricting delivery to the ports above.
pub const CAPTURE_FILTER: &str =
    "tcp port 443 or tcp port 22 or tcp port 993 or tcp port 995 or tcp port 465 or tcp port 587";

const TLS_CONTENT_HANDSHAKE: u8 = 0x16;
const SSH_IDENT: &[u8] = b"SSH-";

/// Candidate protocol for a well-known port.
pub fn protocol_for_port(port: u16) -> Option<CryptoProtocol> {
    if TLS_PORTS.contains(&port) {
        Some(CryptoProtocol::Tls)
    } else if port == SSH_PORT {
        Some(CryptoProtocol::Ssh)
    } else {
        None
    }
}

/// Result of running a protocol parser over a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    /// Could be this protocol, but there are not enough bytes to tell.
    Insufficient,
    NotThisProtocol,
}

// ── TLS ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    Certificate,
    Other(u8),
}

impl From<u8> for HandshakeType {
    fn from(b: u8) -> Self {
        match b {
            0x01 => Self::ClientHello,
            0x02 => Self::ServerHello,
            0x0b => Self::Certificate,
            other => Self::Other(other),
        }
    }
}

impl HandshakeType {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Self::ClientHello => Some("ClientHello"),
            Self::ServerHello => Some("ServerHello"),
            Self::Certificate => Some("Certificate"),
            Self::Other(_) => None,
        }
    }
}

/// The head of a TLS handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecord {
    /// Record-layer version, e.g. `0x0303`.
    pub version: u16,
    /// First handshake message type, when the payload reaches it.
    pub handshake: Option<HandshakeType>,
}

impl TlsRecord {
    pub fn version_label(&self) -> &'static str {
        tls_version_label(self.version)
    }
}

pub fn tls_version_label(version: u16) -> &'static str {
    match version {
        0x0301 => "TLS 1.0",
        0x0302 => "TLS 1.1",
        0x0303 => "TLS 1.2",
        0x0304 => "TLS 1.3",
        _ => "Unknown",
    }
}

/// Parse the record header (and first handshake type) of a TLS payload.
///
/// ```text
/// 0      1..=2     3..=4    5
/// type   version   length   handshake type
/// ```
pub fn parse_tls_record(payload: &[u8]) -> ParseOutcome<TlsRecord> {
    match payload.first() {
        None => return ParseOutcome::Insufficient,
        Some(&TLS_CONTENT_HANDSHAKE) => {}
        Some(_) => return ParseOutcome::NotThisProtocol,
    }
    if payload.len() < 3 {
        return ParseOutcome::Insufficient;
    }
    ParseOutcome::Parsed(TlsRecord {
        version: u16::from_be_bytes([payload[1], payload[2]]),
        handshake: payload.get(5).copied().map(HandshakeType::from),
    })
}

// ── SSH ───────────────────────────────────────────────────────────

/// An SSH identification string (`SSH-protoversion-softwareversion`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshBanner {
    /// Everything after `SSH-` up to the line terminator.
    pub version: String,
    pub proto_version: String,
    pub software: String,
}

pub fn parse_ssh_banner(payload: &[u8]) -> ParseOutcome<SshBanner> {
    if payload.len() < SSH_IDENT.len() {
        return if SSH_IDENT.starts_with(payload) {
            ParseOutcome::Insufficient
        } else {
            ParseOutcome::NotThisProtocol
        };
    }
    if !payload.starts_with(SSH_IDENT) {
        return ParseOutcome::NotThisProtocol;
    }

    let rest = &payload[SSH_IDENT.len()..];
    let end = rest
        .iter()
        .position(|b| *b == b'\n' || *b == b'\r')
        .unwrap_or(rest.len());
    let version = String::from_utf8_lossy(&rest[..end]).into_owned();
    let (proto_version, software) = match version.split_once('-') {
        Some((proto, software)) => (proto.to_string(), software.to_string()),
        None => (version.clone(), String::new()),
    };

    ParseOutcome::Parsed(SshBanner {
        version,
        proto_version,
        software,
    })
}

// ── Classification ────────────────────────────────────────────────

/// Which analyses are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintPolicy {
    pub tls: bool,
    pub ssh: bool,
    pub certificates: bool,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self {
            tls: true,
            ssh: true,
            certificates: true,
        }
    }
}

impl FingerprintPolicy {
    pub fn from_features(flags: &FeatureFlags) -> Self {
        let on = |name: &str| flags.get(name).copied().unwrap_or(false);
        Self {
            tls: on(features::TLS_ANALYSIS),
            ssh: on(features::SSH_ANALYSIS),
            certificates: on(features::CERTIFICATE_ANALYSIS),
        }
    }

    fn allows(&self, protocol: CryptoProtocol) -> bool {
        match protocol {
            CryptoProtocol::Tls => self.tls,
            CryptoProtocol::Ssh => self.ssh,
        }
    }
}

/// Classify a segment. The destination port is checked first, then the
/// source port, so server-to-client handshake messages are recognised too.
/// Segments without payload yield nothing.
pub fn classify(
    segment: &TcpSegment,
    interface: &str,
    sensor_id: &str,
    method: DiscoveryMethod,
    policy: &FingerprintPolicy,
) -> Option<Discovery> {
    if segment.payload.is_empty() {
        return None;
    }
    let (port, protocol) = protocol_for_port(segment.dst_port)
        .map(|p| (segment.dst_port, p))
        .or_else(|| protocol_for_port(segment.src_port).map(|p| (segment.src_port, p)))?;
    classify_as(segment, port, protocol, interface, sensor_id, method, policy)
}

/// Classify a segment already attributed to `protocol` on `port`, as the
/// active prober does for endpoints it dialled itself.
pub fn classify_as(
    segment: &TcpSegment,
    port: u16,
    protocol: CryptoProtocol,
    interface: &str,
    sensor_id: &str,
    method: DiscoveryMethod,
    policy: &FingerprintPolicy,
) -> Option<Discovery> {
    if segment.payload.is_empty() || !policy.allows(protocol) {
        return None;
    }

    let mut discovery = Discovery::new(
        sensor_id,
        segment.src_ip,
        segment.dst_ip,
        port,
        protocol,
        method,
    );
    discovery.tag("interface", interface);
    discovery.tag("src_port", segment.src_port);
    discovery.tag("dst_port", segment.dst_port);
    discovery.tag("packet_size", segment.frame_len);

    match protocol {
        CryptoProtocol::Tls => refine_tls(&mut discovery, &segment.payload, policy),
        CryptoProtocol::Ssh => refine_ssh(&mut discovery, &segment.payload),
    }
    Some(discovery)
}

fn refine_tls(discovery: &mut Discovery, payload: &[u8], policy: &FingerprintPolicy) {
    let ParseOutcome::Parsed(record) = parse_tls_record(payload) else {
        return;
    };
    discovery.protocol_version = record.version_label().to_string();

    let Some(handshake) = record.handshake else {
        return;
    };
    let confidence = match handshake {
        HandshakeType::ClientHello | HandshakeType::ServerHello => Confidence::HANDSHAKE,
        HandshakeType::Certificate if policy.certificates => Confidence::CERTIFICATE,
        HandshakeType::Certificate => Confidence::HANDSHAKE,
        HandshakeType::Other(_) => return,
    };
    discovery.raise_confidence(confidence);
    if let Some(label) = handshake.label() {
        discovery.tag("handshake_type", label);
    }
}

fn refine_ssh(discovery: &mut Discovery, payload: &[u8]) {
    if let ParseOutcome::Parsed(banner) = parse_ssh_banner(payload) {
        discovery.raise_confidence(Confidence::HANDSHAKE);
        discovery.tag("ssh_banner", format!("SSH-{}", banner.version));
        if !banner.software.is_empty() {
            discovery.tag("ssh_software", banner.software);
        }
        discovery.protocol_version = banner.version;
    }
}
