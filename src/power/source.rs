//! Where power readings come from: an external sampling command, a seeded
//! synthetic generator, or a fixed script of readings.

use super::powermetrics::RecordFormat;
use super::sample::{DomainPower, RawReading};
use crate::errors::{MonitorError, RecordError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Blocking iterator of parsed records, plus a handle that makes it end.
pub struct SampleStream {
    pub records: Box<dyn Iterator<Item = Result<RawReading, RecordError>> + Send>,
    /// Called from the controlling thread; after it returns the iterator must finish promptly.
    pub stop: Box<dyn FnMut() + Send>,
}

impl fmt::Debug for SampleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStream").finish_non_exhaustive()
    }
}

/// A producer of power readings for [`PowerMonitor`](super::PowerMonitor).
pub trait PowerSource: Send + fmt::Debug {
    fn name(&self) -> &str;

    /// Check that the source can run without interactive authorization.
    fn probe(&self) -> Result<(), MonitorError>;

    /// Begin producing readings at roughly `interval`.
    fn open(&mut self, interval: Duration) -> Result<SampleStream, MonitorError>;
}

/// Runs an external sampler and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    probe_args: Option<Vec<String>>,
    /// Append `-i <ms>` to the command line on open.
    pass_interval: bool,
    format: RecordFormat,
    startup_grace: Duration,
}

const POWERMETRICS_SAMPLERS: &str = "cpu_power,gpu_power,ane_power,thermal";

impl CommandSource {
    /// macOS `powermetrics` in plist mode. When `launcher` is `sudo` the command
    /// runs non-interactively (`sudo -n`), so a missing sudoers grant fails fast.
    pub fn powermetrics(launcher: &str) -> Self {
        let via_sudo = launcher.rsplit('/').next() == Some("sudo");
        let mut args: Vec<String> = Vec::new();
        let mut probe: Vec<String> = Vec::new();
        if via_sudo {
            args.extend(["-n".to_string(), "powermetrics".to_string()]);
            probe.extend(["-n".to_string(), "powermetrics".to_string()]);
        }
        args.extend(
            ["--samplers", POWERMETRICS_SAMPLERS, "-f", "plist"]
                .iter()
                .map(|s| s.to_string()),
        );
        probe.push("--help".to_string());
        Self {
            program: launcher.to_string(),
            args,
            probe_args: Some(probe),
            pass_interval: true,
            format: RecordFormat::Plist,
            startup_grace: Duration::from_millis(200),
        }
    }

    /// Any command that prints one JSON power record per line at its own pace.
    pub fn json_lines(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            probe_args: None,
            pass_interval: false,
            format: RecordFormat::JsonLines,
            startup_grace: Duration::from_millis(100),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    fn spawn_error(&self, err: std::io::Error) -> MonitorError {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                MonitorError::Unavailable(format!("{}: not found", self.program))
            }
            std::io::ErrorKind::PermissionDenied => {
                MonitorError::PermissionDenied(format!("{}: {}", self.program, err))
            }
            _ => MonitorError::Spawn(err),
        }
    }
}

impl PowerSource for CommandSource {
    fn name(&self) -> &str {
        &self.program
    }

    fn probe(&self) -> Result<(), MonitorError> {
        let Some(probe_args) = &self.probe_args else {
            return Ok(());
        };
        let output = Command::new(&self.program)
            .args(probe_args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not found") || stderr.contains("No such file") {
            Err(MonitorError::Unavailable(stderr))
        } else {
            Err(MonitorError::PermissionDenied(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            }))
        }
    }

    fn open(&mut self, interval: Duration) -> Result<SampleStream, MonitorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.pass_interval {
            cmd.arg("-i").arg(interval.as_millis().max(1).to_string());
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        std::thread::sleep(self.startup_grace);
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }
            return Err(MonitorError::TerminatedImmediately {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        if let Some(err) = child.stderr.take() {
            let program = self.program.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(err).lines().map_while(Result::ok) {
                    debug!(sampler = %program, "{}", line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::Unavailable("sampler stdout not captured".to_string()))?;
        let records = DelimitedRecords {
            reader: BufReader::new(stdout),
            format: self.format,
            buf: Vec::with_capacity(16 * 1024),
            done: false,
        };

        let child = Arc::new(Mutex::new(Some(child)));
        let stop = move || {
            if let Some(mut c) = child.lock().take() {
                let _ = c.kill();
                let _ = c.wait();
            }
        };
        Ok(SampleStream {
            records: Box::new(records),
            stop: Box::new(stop),
        })
    }
}

struct DelimitedRecords {
    reader: BufReader<ChildStdout>,
    format: RecordFormat,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for DelimitedRecords {
    type Item = Result<RawReading, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(self.format.delimiter(), &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => match self.format.parse(&self.buf) {
                    Ok(Some(power)) => return Some(Ok(RawReading::live(power))),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

/// Seeded random power around a fixed operating point; for demos and machines
/// without a sampler.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub base: DomainPower,
    /// Uniform jitter applied to each domain, as a fraction of its base value.
    pub jitter: f64,
    pub seed: u64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            base: DomainPower::new(4200.0, 1800.0, 150.0, 600.0),
            jitter: 0.15,
            seed: 42,
        }
    }
}

impl PowerSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn probe(&self) -> Result<(), MonitorError> {
        Ok(())
    }

    fn open(&mut self, interval: Duration) -> Result<SampleStream, MonitorError> {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let base = self.base;
        let jitter = self.jitter.abs();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let records = std::iter::from_fn(move || {
            std::thread::sleep(interval);
            if flag.load(Ordering::Acquire) {
                return None;
            }
            let mut vary = |v: f64| (v * (1.0 + rng.gen_range(-jitter..=jitter))).max(0.0);
            let power = DomainPower::new(
                vary(base.cpu_mw),
                vary(base.gpu_mw),
                vary(base.ane_mw),
                vary(base.dram_mw),
            );
            Some(Ok(RawReading::live(power)))
        });
        Ok(SampleStream {
            records: Box::new(records),
            stop: Box::new(move || stopped.store(true, Ordering::Release)),
        })
    }
}

/// Replays a fixed list of readings, optionally paced.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    readings: Vec<Result<RawReading, String>>,
    pace: Option<Duration>,
}

impl ScriptedSource {
    pub fn new(readings: Vec<RawReading>) -> Self {
        Self {
            readings: readings.into_iter().map(Ok).collect(),
            pace: None,
        }
    }

    /// Readings at explicit offsets, all power on the CPU domain.
    pub fn totals(points: &[(f64, f64)]) -> Self {
        Self::new(
            points
                .iter()
                .map(|&(offset, mw)| RawReading::at(offset, DomainPower::new(mw, 0.0, 0.0, 0.0)))
                .collect(),
        )
    }

    /// Insert a malformed record at the current end of the script.
    pub fn push_malformed(mut self, reason: impl Into<String>) -> Self {
        self.readings.push(Err(reason.into()));
        self
    }

    pub fn push(mut self, reading: RawReading) -> Self {
        self.readings.push(Ok(reading));
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

impl PowerSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn probe(&self) -> Result<(), MonitorError> {
        Ok(())
    }

    fn open(&mut self, _interval: Duration) -> Result<SampleStream, MonitorError> {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let pace = self.pace;
        let mut items = self.readings.clone().into_iter();
        let records = std::iter::from_fn(move || {
            if let Some(p) = pace {
                std::thread::sleep(p);
            }
            if flag.load(Ordering::Acquire) {
                return None;
            }
            items
                .next()
                .map(|r| r.map_err(RecordError::Malformed))
        });
        Ok(SampleStream {
            records: Box::new(records),
            stop: Box::new(move || stopped.store(true, Ordering::Release)),
        })
    }
}

/// Build the configured command source.
pub fn command_source(launcher: &str, format: RecordFormat) -> CommandSource {
    match format {
        RecordFormat::Plist => CommandSource::powermetrics(launcher),
        RecordFormat::JsonLines => CommandSource::json_lines(launcher, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powermetrics_args_use_non_interactive_sudo() {
        let src = CommandSource::powermetrics("sudo");
        assert_eq!(src.args[0], "-n");
        assert_eq!(src.args[1], "powermetrics");
        assert!(src.args.contains(&"plist".to_string()));
        assert_eq!(
            src.probe_args.as_deref(),
            Some(&["-n".to_string(), "powermetrics".to_string(), "--help".to_string()][..])
        );
    }

    #[test]
    fn missing_program_is_unavailable() {
        let mut src = CommandSource::json_lines("definitely-not-a-power-sampler-xyz", vec![]);
        let err = src.open(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, MonitorError::Unavailable(_)), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn sampler_exiting_early_is_reported() {
        let mut src = CommandSource::json_lines(
            "sh",
            vec!["-c".into(), "echo denied >&2; exit 3".into()],
        )
        .with_startup_grace(Duration::from_millis(300));
        match src.open(Duration::from_millis(10)) {
            Err(MonitorError::TerminatedImmediately { stderr, .. }) => assert_eq!(stderr, "denied"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn json_command_stream_parses_and_skips_bad_lines() {
        let script = "printf '{\"cpu_mw\":1000}\\nbogus\\n{\"gpu_mw\":250}\\n'; exec sleep 5";
        let mut src = CommandSource::json_lines("sh", vec!["-c".into(), script.into()]);
        let mut stream = src.open(Duration::from_millis(10)).unwrap();
        let first = stream.records.next().unwrap().unwrap();
        assert_eq!(first.power.cpu_mw, 1000.0);
        assert!(stream.records.next().unwrap().is_err());
        let third = stream.records.next().unwrap().unwrap();
        assert_eq!(third.power.gpu_mw, 250.0);
        (stream.stop)();
        assert!(stream.records.next().is_none());
    }

    #[test]
    fn scripted_source_yields_in_order_with_errors() {
        let mut src = ScriptedSource::totals(&[(0.0, 1.0), (100.0, 2.0)]).push_malformed("x");
        let stream = src.open(Duration::from_millis(1)).unwrap();
        let items: Vec<_> = stream.records.collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_ref().unwrap().offset_ms, Some(100.0));
        assert!(items[2].is_err());
    }

    #[test]
    fn synthetic_source_stops() {
        let mut src = SyntheticSource::default();
        let mut stream = src.open(Duration::from_millis(1)).unwrap();
        let r = stream.records.next().unwrap().unwrap();
        assert!(r.power.total_mw() > 0.0);
        (stream.stop)();
        assert!(stream.records.next().is_none());
    }
}
