//! Background power sampler.
//!
//! A dedicated thread pulls records from a [`PowerSource`], stamps them with the
//! session clock and appends them to a bounded [`SampleBuffer`]. The buffer is the
//! only state shared with the workload thread.

use super::buffer::SampleBuffer;
use super::sample::{IdleBaseline, PeakPower, PowerSample};
use super::source::{command_source, PowerSource, SampleStream};
use crate::config::ProfilerConfig;
use crate::errors::MonitorError;
use crate::profiling::clock::SharedClock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Worker {
    handle: JoinHandle<()>,
    stop: Box<dyn FnMut() + Send>,
}

/// Counters maintained by the sampling thread.
#[derive(Debug, Default)]
struct SamplerStats {
    accepted: AtomicU64,
    skipped: AtomicU64,
}

pub struct PowerMonitor {
    source: Option<Box<dyn PowerSource>>,
    buffer: SampleBuffer,
    clock: SharedClock,
    interval: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<SamplerStats>,
    worker: Option<Worker>,
}

impl std::fmt::Debug for PowerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerMonitor")
            .field("source", &self.source_name())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl PowerMonitor {
    pub fn new(
        source: Box<dyn PowerSource>,
        clock: SharedClock,
        interval: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            source: Some(source),
            buffer: SampleBuffer::new(capacity),
            clock,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SamplerStats::default()),
            worker: None,
        }
    }

    /// A monitor with no sampler attached. It cannot start, but accepts [`feed`](Self::feed).
    pub fn without_source(clock: SharedClock, interval: Duration, capacity: usize) -> Self {
        Self {
            source: None,
            buffer: SampleBuffer::new(capacity),
            clock,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SamplerStats::default()),
            worker: None,
        }
    }

    /// The external sampling command described by the configuration.
    pub fn from_config(config: &ProfilerConfig, clock: SharedClock) -> Self {
        let source = command_source(&config.power_command, config.power_format);
        Self::new(
            Box::new(source),
            clock,
            config.sample_interval(),
            config.sample_buffer_capacity,
        )
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().map(|s| s.name()).unwrap_or("none")
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn interval_ms(&self) -> f64 {
        self.interval.as_secs_f64() * 1000.0
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Probe whether sampling could start, without starting it.
    pub fn probe(&self) -> Result<(), MonitorError> {
        match &self.source {
            Some(s) => s.probe(),
            None => Err(MonitorError::Unavailable("no power source configured".to_string())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.probe().is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the sampling thread.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.worker.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| MonitorError::Unavailable("no power source configured".to_string()))?;
        source.probe()?;
        let SampleStream { records, mut stop } = source.open(self.interval)?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let buffer = self.buffer.clone();
        let clock = Arc::clone(&self.clock);
        let stats = Arc::clone(&self.stats);
        let name = source.name().to_string();

        let spawned = std::thread::Builder::new()
            .name("power-sampler".to_string())
            .spawn(move || {
                for record in records {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    match record {
                        Ok(reading) => {
                            let offset = reading.offset_ms.unwrap_or_else(|| clock.now_ms());
                            if buffer.push(PowerSample::new(offset, reading.power)) {
                                stats.accepted.fetch_add(1, Ordering::Relaxed);
                            } else {
                                stats.skipped.fetch_add(1, Ordering::Relaxed);
                                debug!(offset_ms = offset, "dropped out-of-order power sample");
                            }
                        }
                        Err(e) => {
                            stats.skipped.fetch_add(1, Ordering::Relaxed);
                            warn!(source = %name, error = %e, "skipping malformed power record");
                        }
                    }
                }
                running.store(false, Ordering::Release);
                debug!(source = %name, "power sampler thread exiting");
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                stop();
                return Err(e.into());
            }
        };

        info!(
            source = %self.source_name(),
            interval_ms = self.interval.as_millis() as u64,
            "power monitor started"
        );
        self.worker = Some(Worker { handle, stop });
        Ok(())
    }

    /// Stop the sampler and join its thread. No sample is produced after this returns.
    pub fn stop(&mut self) -> Result<(), MonitorError> {
        let Some(mut worker) = self.worker.take() else {
            return Err(MonitorError::NotRunning);
        };
        self.running.store(false, Ordering::Release);
        (worker.stop)();
        if worker.handle.join().is_err() {
            warn!("power sampler thread panicked");
        }
        info!(
            samples = self.stats.accepted.load(Ordering::Relaxed),
            skipped = self.stats.skipped.load(Ordering::Relaxed),
            "power monitor stopped"
        );
        Ok(())
    }

    /// Whether a sampling thread is attached (it may already have run out of records).
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn read_latest(&self) -> Option<PowerSample> {
        self.buffer.latest()
    }

    /// Copies of buffered samples with offset strictly after `offset_ms`.
    pub fn drain_since(&self, offset_ms: f64) -> Vec<PowerSample> {
        self.buffer.since(offset_ms)
    }

    pub fn samples(&self) -> Vec<PowerSample> {
        self.buffer.snapshot()
    }

    /// Inject an externally produced sample. Returns false if it was rejected.
    pub fn feed(&self, sample: PowerSample) -> bool {
        let ok = self.buffer.push(sample);
        if ok {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn peak_power(&self) -> PeakPower {
        self.buffer.peak()
    }

    pub fn evicted(&self) -> u64 {
        self.buffer.evicted()
    }

    /// Records dropped by the sampling loop (malformed or out of order).
    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    /// Average power over the next `window` of wall time. Requires a running sampler.
    pub fn measure_idle_baseline(
        &self,
        window: Duration,
    ) -> Result<Option<IdleBaseline>, MonitorError> {
        if self.worker.is_none() {
            return Err(MonitorError::NotRunning);
        }
        let start = self
            .buffer
            .latest()
            .map(|s| s.offset_ms)
            .unwrap_or(f64::NEG_INFINITY);
        std::thread::sleep(window);
        let samples = self.buffer.since(start);
        let baseline = IdleBaseline::from_samples(&samples, window.as_secs_f64() * 1000.0);
        match &baseline {
            Some(b) => info!(
                power_mw = b.power_mw,
                samples = b.sample_count,
                "idle baseline measured"
            ),
            None => warn!("no power samples arrived during idle baseline window"),
        }
        Ok(baseline)
    }
}

impl Drop for PowerMonitor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}
