//! Probe calibration tables and the on-device calibration record parser.
//!
//! The device stores its active calibration as a tagged datafile. The host
//! reads it over the control pipe, locates the `AJS` (JSON) tag and parses
//! per-range gain/offset tables out of it. JSON has no NaN literal, so the
//! device substitutes the string `NaN`; the parser maps those through a
//! large sentinel value back to `f32::NAN`.

use crate::error::ProbeError;
use serde_json::Value;

/// Current front-end ranges 0–6 are active gains, 7 is "off", 8 is the
/// synthetic "missing sample" range.
pub const CURRENT_RANGES: usize = 8;
pub const VOLTAGE_RANGES: usize = 2;

/// Length of the datafile header that precedes the tagged payload.
pub const HEADER_LENGTH: usize = 32;

/// Values above this are NaN placeholders smuggled through JSON.
const NAN_SENTINEL: f64 = 1e19;

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub current_offset: [f32; CURRENT_RANGES],
    pub current_gain: [f32; CURRENT_RANGES],
    pub voltage_offset: [f32; VOLTAGE_RANGES],
    pub voltage_gain: [f32; VOLTAGE_RANGES],
}

impl Default for Calibration {
    fn default() -> Self {
        let mut cal = Self {
            current_offset: [0.0; CURRENT_RANGES],
            current_gain: [1.0; CURRENT_RANGES],
            voltage_offset: [0.0; VOLTAGE_RANGES],
            voltage_gain: [1.0; VOLTAGE_RANGES],
        };
        cal.normalize();
        cal
    }
}

impl Calibration {
    /// Force the "off" range entries so a powered-down front end reads 0 A.
    pub fn normalize(&mut self) {
        self.current_offset[7] = 0.0;
        self.current_gain[7] = 0.0;
    }

    /// Parse the JSON body of a calibration record.
    pub fn from_device_json(json: &str) -> Result<Self, ProbeError> {
        // The device writes literal `NaN` tokens, which serde_json rejects.
        // No real gain or offset approaches the sentinel magnitude.
        let sanitized = json.replace("NaN", "1e20");
        let root: Value = serde_json::from_str(&sanitized)
            .map_err(|e| ProbeError::Communication(format!("calibration JSON: {e}")))?;

        let mut cal = Self::default();
        for i in 0..CURRENT_RANGES {
            cal.current_gain[i] = field(&root, "current", "gain", i)?;
            cal.current_offset[i] = field(&root, "current", "offset", i)?;
        }
        for i in 0..VOLTAGE_RANGES {
            cal.voltage_gain[i] = field(&root, "voltage", "gain", i)?;
            cal.voltage_offset[i] = field(&root, "voltage", "offset", i)?;
        }
        cal.normalize();
        Ok(cal)
    }

    /// Parse a full calibration datafile: scan for the `AJS` tag, then parse
    /// the length-prefixed JSON payload that follows it.
    pub fn parse_datafile(raw: &[u8]) -> Result<Self, ProbeError> {
        let tag_pos = raw
            .windows(3)
            .position(|w| w == b"AJS")
            .ok_or_else(|| ProbeError::Communication("calibration record has no AJS tag".into()))?;
        let len_start = tag_pos + 4;
        if raw.len() < len_start + 4 {
            return Err(ProbeError::Communication("calibration record truncated".into()));
        }
        let tag_length =
            u32::from_le_bytes(raw[len_start..len_start + 4].try_into().expect("slice length"))
                as usize;
        let json_start = len_start + 4;
        if raw.len() < json_start + tag_length {
            return Err(ProbeError::Communication("calibration JSON truncated".into()));
        }
        let json = std::str::from_utf8(&raw[json_start..json_start + tag_length])
            .map_err(|e| ProbeError::Communication(format!("calibration JSON: {e}")))?;
        Self::from_device_json(json)
    }
}

/// Total record length from a 32-byte datafile header.
///
/// Header layout: magic (16 bytes), length (u64), reserved (3 bytes),
/// file_version (u8), crc32 (u32).
pub fn record_length(header: &[u8]) -> Result<u64, ProbeError> {
    if header.len() < HEADER_LENGTH {
        return Err(ProbeError::Communication(format!(
            "calibration header was {} bytes, expected {HEADER_LENGTH}",
            header.len()
        )));
    }
    Ok(u64::from_le_bytes(header[16..24].try_into().expect("slice length")))
}

fn field(root: &Value, channel: &str, kind: &str, index: usize) -> Result<f32, ProbeError> {
    let value = root[channel][kind]
        .get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            ProbeError::Communication(format!("calibration JSON missing {channel}.{kind}[{index}]"))
        })?;
    if value.abs() > NAN_SENTINEL {
        Ok(f32::NAN)
    } else {
        Ok(value as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAL_JSON: &str = r#"{
        "voltage": {"gain": [0.001, 0.002], "offset": [-1.0, -2.0]},
        "current": {
            "gain": [1.0, 0.1, 0.01, 0.001, 1e-4, 1e-5, 1e-6, NaN],
            "offset": [0.5, 0.4, 0.3, 0.2, 0.1, 0.0, -0.1, NaN]
        }
    }"#;

    #[test]
    fn default_forces_off_range_to_zero() {
        let cal = Calibration::default();
        assert_eq!(cal.current_gain[7], 0.0);
        assert_eq!(cal.current_gain[0], 1.0);
        assert_eq!(cal.voltage_gain[0], 1.0);
    }

    #[test]
    fn parses_device_json_with_nan_tokens() {
        let cal = Calibration::from_device_json(CAL_JSON).unwrap();
        assert_eq!(cal.voltage_gain[1], 0.002);
        assert_eq!(cal.current_gain[2], 0.01);
        assert_eq!(cal.current_offset[0], 0.5);
        // Range 7 is normalized back to "off" even when the record says NaN.
        assert_eq!(cal.current_gain[7], 0.0);
        assert_eq!(cal.current_offset[7], 0.0);
    }

    #[test]
    fn parses_tagged_datafile() {
        let json = CAL_JSON.as_bytes();
        let mut raw = vec![0u8; 64];
        raw.extend_from_slice(b"AJS\0");
        raw.extend_from_slice(&(json.len() as u32).to_le_bytes());
        raw.extend_from_slice(json);
        raw.extend_from_slice(&[0u8; 16]);
        let cal = Calibration::parse_datafile(&raw).unwrap();
        assert_eq!(cal.current_gain[1], 0.1);
    }

    #[test]
    fn record_length_reads_header() {
        let mut header = [0u8; HEADER_LENGTH];
        header[16..24].copy_from_slice(&0x1234u64.to_le_bytes());
        assert_eq!(record_length(&header).unwrap(), 0x1234);
        assert!(record_length(&header[..8]).is_err());
    }
}
