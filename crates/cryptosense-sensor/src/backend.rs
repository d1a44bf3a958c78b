//! Capture backends.
//!
//! The capture manager talks to interfaces through [`CaptureBackend`] so
//! the pipeline can run against live libpcap handles in production and
//! scripted frame sources in tests.

use crate::capture::CaptureError;
use crate::config::CaptureConfig;
use crate::frame::LinkKind;

/// Result of one read from a frame source.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// Nothing arrived within the read timeout.
    Timeout,
    /// The source is exhausted and will never yield again.
    Closed,
}

/// An open capture handle. Reads block for at most the configured timeout.
pub trait FrameSource: Send {
    fn link(&self) -> LinkKind;

    fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError>;

    fn next_frame(&mut self) -> Result<ReadOutcome, CaptureError>;
}

/// Enumerates and opens interfaces.
pub trait CaptureBackend: Send + Sync {
    /// Names of the interfaces present on the host.
    fn interfaces(&self) -> Result<Vec<String>, CaptureError>;

    fn open(&self, interface: &str, config: &CaptureConfig)
        -> Result<Box<dyn FrameSource>, CaptureError>;
}

// ── libpcap ───────────────────────────────────────────────────────

/// Live capture through libpcap.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcapBackend;

struct PcapSource {
    interface: String,
    capture: pcap::Capture<pcap::Active>,
    link: LinkKind,
}

impl CaptureBackend for PcapBackend {
    fn interfaces(&self) -> Result<Vec<String>, CaptureError> {
        let devices = pcap::Device::list().map_err(|e| CaptureError::Backend(e.to_string()))?;
        Ok(devices.into_iter().map(|d| d.name).collect())
    }

    fn open(
        &self,
        interface: &str,
        config: &CaptureConfig,
    ) -> Result<Box<dyn FrameSource>, CaptureError> {
        let open_err = |e: pcap::Error| CaptureError::Open {
            interface: interface.to_string(),
            reason: e.to_string(),
        };

        let buffer_size = i32::try_from(config.buffer_size).unwrap_or(i32::MAX);
        let capture = pcap::Capture::from_device(interface)
            .map_err(open_err)?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .buffer_size(buffer_size)
            .timeout(config.read_timeout_ms)
            .open()
            .map_err(open_err)?;

        let link = match capture.get_datalink() {
            pcap::Linktype::ETHERNET => LinkKind::Ethernet,
            pcap::Linktype::LINUX_SLL => LinkKind::LinuxSll,
            _ => LinkKind::RawIp,
        };

        Ok(Box::new(PcapSource {
            interface: interface.to_string(),
            capture,
            link,
        }))
    }
}

impl FrameSource for PcapSource {
    fn link(&self) -> LinkKind {
        self.link
    }

    fn set_filter(&mut self, expr: &str) -> Result<(), CaptureError> {
        self.capture
            .filter(expr, true)
            .map_err(|e| CaptureError::Filter {
                interface: self.interface.clone(),
                reason: e.to_string(),
            })
    }

    fn next_frame(&mut self) -> Result<ReadOutcome, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(ReadOutcome::Frame(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(ReadOutcome::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(ReadOutcome::Closed),
            Err(e) => Err(CaptureError::Read {
                interface: self.interface.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
