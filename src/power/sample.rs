//! Power samples and per-domain readings.

use crate::profiling::Phase;
use serde::{Deserialize, Serialize};

/// Instantaneous power per metered domain, in milliwatts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainPower {
    pub cpu_mw: f64,
    pub gpu_mw: f64,
    /// Dedicated accelerator (e.g. Apple Neural Engine).
    pub ane_mw: f64,
    pub dram_mw: f64,
}

impl DomainPower {
    pub fn new(cpu_mw: f64, gpu_mw: f64, ane_mw: f64, dram_mw: f64) -> Self {
        Self {
            cpu_mw,
            gpu_mw,
            ane_mw,
            dram_mw,
        }
    }

    pub fn total_mw(&self) -> f64 {
        self.cpu_mw + self.gpu_mw + self.ane_mw + self.dram_mw
    }

    fn is_finite(&self) -> bool {
        self.cpu_mw.is_finite()
            && self.gpu_mw.is_finite()
            && self.ane_mw.is_finite()
            && self.dram_mw.is_finite()
    }
}

/// One parsed record from a power source, before it is placed on the session timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    /// Explicit offset for replayed/scripted readings; live readings take the clock time.
    pub offset_ms: Option<f64>,
    pub power: DomainPower,
}

impl RawReading {
    pub fn live(power: DomainPower) -> Self {
        Self {
            offset_ms: None,
            power,
        }
    }

    pub fn at(offset_ms: f64, power: DomainPower) -> Self {
        Self {
            offset_ms: Some(offset_ms),
            power,
        }
    }
}

/// One periodic power reading on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// Milliseconds since the session clock epoch.
    pub offset_ms: f64,
    pub cpu_mw: f64,
    pub gpu_mw: f64,
    pub ane_mw: f64,
    pub dram_mw: f64,
    pub total_mw: f64,
    /// Phase containing this sample; assigned when the run is closed.
    pub phase: Phase,
}

impl PowerSample {
    pub fn new(offset_ms: f64, power: DomainPower) -> Self {
        Self {
            offset_ms,
            cpu_mw: power.cpu_mw,
            gpu_mw: power.gpu_mw,
            ane_mw: power.ane_mw,
            dram_mw: power.dram_mw,
            total_mw: power.total_mw(),
            phase: Phase::Idle,
        }
    }

    /// Convenience for synthetic data: all power on the CPU domain.
    pub fn with_total(offset_ms: f64, total_mw: f64) -> Self {
        Self::new(offset_ms, DomainPower::new(total_mw, 0.0, 0.0, 0.0))
    }

    pub fn domains(&self) -> DomainPower {
        DomainPower::new(self.cpu_mw, self.gpu_mw, self.ane_mw, self.dram_mw)
    }

    pub fn total_w(&self) -> f64 {
        self.total_mw / 1000.0
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.offset_ms.is_finite() && self.total_mw.is_finite() && self.domains().is_finite()
    }
}

/// Highest power seen per domain since the monitor started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakPower {
    pub total_mw: f64,
    pub cpu_mw: f64,
    pub gpu_mw: f64,
    pub ane_mw: f64,
    pub dram_mw: f64,
}

impl PeakPower {
    pub fn observe(&mut self, s: &PowerSample) {
        self.total_mw = self.total_mw.max(s.total_mw);
        self.cpu_mw = self.cpu_mw.max(s.cpu_mw);
        self.gpu_mw = self.gpu_mw.max(s.gpu_mw);
        self.ane_mw = self.ane_mw.max(s.ane_mw);
        self.dram_mw = self.dram_mw.max(s.dram_mw);
    }
}

/// Mean idle power measured before a workload starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdleBaseline {
    pub power_mw: f64,
    pub cpu_mw: f64,
    pub gpu_mw: f64,
    pub ane_mw: f64,
    pub dram_mw: f64,
    pub sample_count: usize,
    pub window_ms: f64,
}

impl IdleBaseline {
    pub fn from_samples(samples: &[PowerSample], window_ms: f64) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = |f: fn(&PowerSample) -> f64| samples.iter().map(f).sum::<f64>() / n;
        Some(Self {
            power_mw: mean(|s| s.total_mw),
            cpu_mw: mean(|s| s.cpu_mw),
            gpu_mw: mean(|s| s.gpu_mw),
            ane_mw: mean(|s| s.ane_mw),
            dram_mw: mean(|s| s.dram_mw),
            sample_count: samples.len(),
            window_ms,
        })
    }
}
