//! Hardware power sampling and energy integration.

pub mod buffer;
pub mod energy;
pub mod monitor;
pub mod powermetrics;
pub mod sample;
pub mod source;

pub use buffer::SampleBuffer;
pub use energy::{average_power_mw, covered_ms, covering, integrate_energy_mj};
pub use monitor::PowerMonitor;
pub use powermetrics::{parse_json_record, parse_plist_record, RecordFormat};
pub use sample::{DomainPower, IdleBaseline, PeakPower, PowerSample, RawReading};
pub use source::{command_source, CommandSource, PowerSource, SampleStream, ScriptedSource, SyntheticSource};
