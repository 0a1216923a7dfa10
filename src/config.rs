//! Application settings, loaded from an optional TOML file.
//!
//! Every knob has a default that matches the observed device tuning, so the
//! binary runs without any configuration present. A settings file only needs
//! to name the fields it overrides.

use crate::error::ProbeError;
use crate::pipeline::processor::SuppressMode;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Number of bulk-in transfers kept in flight on the streaming endpoint.
    pub transfers: usize,
    /// Length of each bulk-in transfer, in 512-byte packets.
    pub transfer_packets: usize,
    /// Default downsampled output rate in Hz; must divide 2,000,000.
    pub sample_rate: u32,
    /// Range-switch glitch handling: "off", "nan", "mean" or "interp".
    pub suppress_mode: String,
    /// History samples folded into the "mean" suppression window.
    pub suppress_samples_pre: usize,
    /// Trailing samples emitted untouched after a suppression window.
    pub suppress_samples_post: usize,
    /// Fixed suppression window length; unset uses the charge-coupling table.
    pub suppress_window: Option<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transfers: 8,
            transfer_packets: 256,
            sample_rate: 1000,
            suppress_mode: "mean".to_string(),
            suppress_samples_pre: 2,
            suppress_samples_post: 2,
            suppress_window: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ProbeError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        let settings: Settings =
            toml::from_str(&text).map_err(|e| ProbeError::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.transfers == 0 {
            return Err(ProbeError::Config("transfers must be at least 1".into()));
        }
        if self.transfer_packets == 0 {
            return Err(ProbeError::Config("transfer_packets must be at least 1".into()));
        }
        crate::pipeline::downsample::validate_sample_rate(self.sample_rate)?;
        self.suppress_mode()?;
        Ok(())
    }

    pub fn suppress_mode(&self) -> Result<SuppressMode, ProbeError> {
        match self.suppress_mode.as_str() {
            "off" => Ok(SuppressMode::Off),
            "nan" => Ok(SuppressMode::Nan),
            "mean" => Ok(SuppressMode::Mean),
            "interp" => Ok(SuppressMode::Interp),
            other => Err(ProbeError::Config(format!("unknown suppress_mode '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.transfers, 8);
        assert_eq!(settings.sample_rate, 1000);
        assert_eq!(settings.suppress_mode().unwrap(), SuppressMode::Mean);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            sample_rate = 10000
            suppress_mode = "interp"
            "#,
        )
        .unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.sample_rate, 10_000);
        assert_eq!(settings.suppress_mode().unwrap(), SuppressMode::Interp);
        assert_eq!(settings.transfers, 8);
    }

    #[test]
    fn bad_mode_is_rejected() {
        let settings = Settings {
            suppress_mode: "median".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
