//! Record parsers: macOS `powermetrics` plist output and a JSON-lines format.

use super::sample::DomainPower;
use crate::errors::RecordError;
use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Structured record format emitted by the sampling utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// NUL-separated XML property lists (`powermetrics -f plist`).
    Plist,
    /// One JSON object per line: `{"cpu_mw":..,"gpu_mw":..,"ane_mw":..,"dram_mw":..}`.
    JsonLines,
}

impl RecordFormat {
    /// Byte that terminates one record on the sampler's stdout.
    pub fn delimiter(&self) -> u8 {
        match self {
            RecordFormat::Plist => b'\0',
            RecordFormat::JsonLines => b'\n',
        }
    }

    /// Parse one record. Empty (whitespace-only) records are `Ok(None)`.
    pub fn parse(&self, bytes: &[u8]) -> Result<Option<DomainPower>, RecordError> {
        let trimmed = trim_ascii(bytes);
        if trimmed.is_empty() {
            return Ok(None);
        }
        match self {
            RecordFormat::Plist => parse_plist_record(trimmed).map(Some),
            RecordFormat::JsonLines => parse_json_record(trimmed).map(Some),
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace() && *b != 0)
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end.max(start)]
}

fn number(v: &Value) -> Option<f64> {
    v.as_real()
        .or_else(|| v.as_signed_integer().map(|i| i as f64))
        .or_else(|| v.as_unsigned_integer().map(|u| u as f64))
}

fn get_number(dict: &Dictionary, key: &str) -> Option<f64> {
    dict.get(key).and_then(number)
}

fn get_dict<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a Dictionary> {
    dict.get(key).and_then(Value::as_dictionary)
}

/// CPU: sum of cluster `cpu_power`, else `processor.cpu_power`.
fn cpu_power(root: &Dictionary) -> Option<f64> {
    let processor = get_dict(root, "processor")?;
    let clusters: Vec<f64> = processor
        .get("clusters")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_dictionary)
                .filter_map(|c| get_number(c, "cpu_power"))
                .collect()
        })
        .unwrap_or_default();
    if !clusters.is_empty() {
        return Some(clusters.iter().sum());
    }
    get_number(processor, "cpu_power")
}

fn gpu_power(root: &Dictionary) -> Option<f64> {
    let from_processor = get_dict(root, "processor").and_then(|p| {
        get_dict(p, "gpu")
            .and_then(|g| get_number(g, "gpu_power"))
            .or_else(|| get_number(p, "gpu_power"))
    });
    from_processor.or_else(|| get_dict(root, "gpu").and_then(|g| get_number(g, "gpu_power")))
}

fn ane_power(root: &Dictionary) -> Option<f64> {
    let processor = get_dict(root, "processor")?;
    get_dict(processor, "ane")
        .and_then(|a| get_number(a, "power"))
        .or_else(|| get_number(processor, "ane_power"))
}

/// DRAM: sum of thermal channels named `DRAM*`, else `processor.dram_power`.
fn dram_power(root: &Dictionary) -> Option<f64> {
    let channels: Vec<f64> = get_dict(root, "thermal")
        .and_then(|t| t.get("channels"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_dictionary)
                .filter(|c| {
                    c.get("name")
                        .and_then(Value::as_string)
                        .map(|n| n.to_ascii_uppercase().starts_with("DRAM"))
                        .unwrap_or(false)
                })
                .filter_map(|c| get_number(c, "power"))
                .collect()
        })
        .unwrap_or_default();
    if !channels.is_empty() {
        return Some(channels.iter().sum());
    }
    get_dict(root, "processor").and_then(|p| get_number(p, "dram_power"))
}

/// Parse one powermetrics plist document. Missing domains read as zero; a record
/// with no recognised domain at all is rejected.
pub fn parse_plist_record(bytes: &[u8]) -> Result<DomainPower, RecordError> {
    let value = Value::from_reader(Cursor::new(bytes))?;
    let root = value
        .as_dictionary()
        .ok_or_else(|| RecordError::Malformed("plist root is not a dictionary".to_string()))?;
    domains_from_dict(root)
}

pub(crate) fn domains_from_dict(root: &Dictionary) -> Result<DomainPower, RecordError> {
    let cpu = cpu_power(root);
    let gpu = gpu_power(root);
    let ane = ane_power(root);
    let dram = dram_power(root);
    if cpu.is_none() && gpu.is_none() && ane.is_none() && dram.is_none() {
        return Err(RecordError::MissingDomain);
    }
    Ok(DomainPower::new(
        cpu.unwrap_or(0.0),
        gpu.unwrap_or(0.0),
        ane.unwrap_or(0.0),
        dram.unwrap_or(0.0),
    ))
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    cpu_mw: Option<f64>,
    #[serde(default)]
    gpu_mw: Option<f64>,
    #[serde(default, alias = "accelerator_mw")]
    ane_mw: Option<f64>,
    #[serde(default, alias = "memory_mw")]
    dram_mw: Option<f64>,
}

pub fn parse_json_record(bytes: &[u8]) -> Result<DomainPower, RecordError> {
    let r: JsonRecord = serde_json::from_slice(bytes)?;
    if r.cpu_mw.is_none() && r.gpu_mw.is_none() && r.ane_mw.is_none() && r.dram_mw.is_none() {
        return Err(RecordError::MissingDomain);
    }
    let p = DomainPower::new(
        r.cpu_mw.unwrap_or(0.0),
        r.gpu_mw.unwrap_or(0.0),
        r.ane_mw.unwrap_or(0.0),
        r.dram_mw.unwrap_or(0.0),
    );
    if !p.total_mw().is_finite() || p.total_mw() < 0.0 {
        return Err(RecordError::Malformed(format!(
            "power out of range: {}",
            p.total_mw()
        )));
    }
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict>
                <key>name</key><string>E-Cluster</string>
                <key>cpu_power</key><real>1250.5</real>
            </dict>
            <dict>
                <key>name</key><string>P-Cluster</string>
                <key>cpu_power</key><real>3450.2</real>
            </dict>
        </array>
        <key>gpu</key>
        <dict><key>gpu_power</key><real>5678.9</real></dict>
        <key>ane</key>
        <dict><key>power</key><real>234.7</real></dict>
    </dict>
    <key>thermal</key>
    <dict>
        <key>channels</key>
        <array>
            <dict><key>name</key><string>DRAM0</string><key>power</key><real>890.3</real></dict>
            <dict><key>name</key><string>DRAM1</string><key>power</key><real>910.5</real></dict>
            <dict><key>name</key><string>SOC</string><key>power</key><real>77.0</real></dict>
        </array>
    </dict>
</dict>
</plist>
"#;

    const MINIMAL_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>processor</key>
    <dict>
        <key>clusters</key>
        <array>
            <dict><key>cpu_power</key><real>1000.0</real></dict>
        </array>
    </dict>
</dict>
</plist>
"#;

    #[test]
    fn parses_complete_record() {
        let p = parse_plist_record(SAMPLE_PLIST.as_bytes()).unwrap();
        assert!((p.cpu_mw - 4700.7).abs() < 0.01);
        assert!((p.gpu_mw - 5678.9).abs() < 0.01);
        assert!((p.ane_mw - 234.7).abs() < 0.01);
        assert!((p.dram_mw - 1800.8).abs() < 0.01);
        let expected = 4700.7 + 5678.9 + 234.7 + 1800.8;
        assert!((p.total_mw() - expected).abs() < 0.01);
    }

    #[test]
    fn missing_domains_are_zero() {
        let p = parse_plist_record(MINIMAL_PLIST.as_bytes()).unwrap();
        assert_eq!(p.cpu_mw, 1000.0);
        assert_eq!(p.gpu_mw, 0.0);
        assert_eq!(p.ane_mw, 0.0);
        assert_eq!(p.dram_mw, 0.0);
        assert_eq!(p.total_mw(), 1000.0);
    }

    #[test]
    fn broken_xml_is_error() {
        let broken = "<?xml version=\"1.0\"?>\n<plist version=\"1.0\">\n<dict>\n<key>broken\n</plist>";
        assert!(parse_plist_record(broken.as_bytes()).is_err());
    }

    #[test]
    fn unrelated_dict_is_missing_domain() {
        let other = r#"<?xml version="1.0"?><plist version="1.0"><dict><key>invalid</key><string>structure</string></dict></plist>"#;
        assert!(matches!(
            parse_plist_record(other.as_bytes()),
            Err(RecordError::MissingDomain)
        ));
    }

    #[test]
    fn record_format_skips_blank_and_nul_padding() {
        assert!(RecordFormat::Plist.parse(b"\0\n  ").unwrap().is_none());
        let mut padded = b"\0\n".to_vec();
        padded.extend_from_slice(MINIMAL_PLIST.as_bytes());
        let p = RecordFormat::Plist.parse(&padded).unwrap().unwrap();
        assert_eq!(p.cpu_mw, 1000.0);
    }

    #[test]
    fn json_lines_record() {
        let p = RecordFormat::JsonLines
            .parse(br#"{"cpu_mw": 1.5, "gpu_mw": 2.0, "memory_mw": 0.5}"#)
            .unwrap()
            .unwrap();
        assert_eq!(p.total_mw(), 4.0);
        assert!(RecordFormat::JsonLines.parse(b"{}").is_err());
        assert!(RecordFormat::JsonLines.parse(b"not json").is_err());
        assert!(RecordFormat::JsonLines.parse(br#"{"cpu_mw": -5}"#).is_err());
    }
}
