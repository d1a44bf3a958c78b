//! Sensor health counters.
//!
//! Counters are lock-free and shared by the capture pipeline, the prober
//! and the control loop. A [`HealthSampler`] turns them into the
//! [`SensorHealth`] report sent with each heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use sysinfo::{ProcessExt, System, SystemExt};

use cryptosense_core::wire::{SensorHealth, SensorStatus};

#[derive(Debug, Default)]
pub struct HealthCounters {
    packets_captured: AtomicU64,
    frames_dropped: AtomicU64,
    discoveries_made: AtomicU64,
    discoveries_dropped: AtomicU64,
    probes_sent: AtomicU64,
    submissions_failed: AtomicU64,
    errors: AtomicU64,
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_captured(&self) {
        self.packets_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new total.
    pub fn frame_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn discovery_made(&self) {
        self.discoveries_made.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new total.
    pub fn discovery_dropped(&self) -> u64 {
        self.discoveries_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission_failed(&self) {
        self.submissions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            discoveries_made: self.discoveries_made.load(Ordering::Relaxed),
            discoveries_dropped: self.discoveries_dropped.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            submissions_failed: self.submissions_failed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub packets_captured: u64,
    pub frames_dropped: u64,
    pub discoveries_made: u64,
    pub discoveries_dropped: u64,
    pub probes_sent: u64,
    pub submissions_failed: u64,
    pub errors: u64,
}

/// Builds heartbeat health reports, sampling process memory and CPU.
pub struct HealthSampler {
    started: Instant,
    system: System,
}

impl Default for HealthSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSampler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            system: System::new(),
        }
    }

    /// Resident memory (bytes) and CPU percent of this process.
    fn process_usage(&mut self) -> (u64, f32) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return (0, 0.0);
        };
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0))
    }

    pub fn sample(
        &mut self,
        sensor_id: &str,
        status: SensorStatus,
        counters: &HealthCounters,
        pending_submissions: usize,
        capture_running: bool,
    ) -> SensorHealth {
        let (memory_usage, cpu_usage) = self.process_usage();
        let c = counters.snapshot();
        let now = Utc::now();

        let mut metrics = serde_json::Map::new();
        metrics.insert("capture_running".into(), capture_running.into());
        metrics.insert("probes_sent".into(), c.probes_sent.into());
        metrics.insert("submissions_failed".into(), c.submissions_failed.into());

        SensorHealth {
            sensor_id: sensor_id.to_string(),
            status,
            last_heartbeat: now,
            uptime_seconds: self.started.elapsed().as_secs(),
            memory_usage,
            cpu_usage,
            packets_captured: c.packets_captured,
            frames_dropped: c.frames_dropped,
            discoveries_made: c.discoveries_made,
            discoveries_dropped: c.discoveries_dropped,
            pending_submissions: pending_submissions as u64,
            errors: c.errors,
            metrics,
            timestamp: now,
        }
    }
}
