use crate::clock::seconds;
use crate::devices::{CameraKind, DeviceKind};
use crate::safety::SafetyEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationTime {
    Start,
    #[default]
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude_deg: 38.828_303,
            longitude_deg: -77.305_254,
            altitude_m: 154.0,
        }
    }
}

/// Bounded waits, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub liveness_secs: f64,
    pub coordination_secs: f64,
    pub slew_secs: f64,
    pub shutter_secs: f64,
    pub lamp_secs: f64,
    pub guider_stop_secs: f64,
    pub cooler_secs: f64,
    pub focus_secs: f64,
    pub request_secs: f64,
    /// Added to twice the exposure time when waiting for an image.
    pub exposure_margin_secs: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            liveness_secs: 10.0,
            coordination_secs: 60.0,
            slew_secs: 300.0,
            shutter_secs: 240.0,
            lamp_secs: 60.0,
            guider_stop_secs: 10.0,
            cooler_secs: 600.0,
            focus_secs: 900.0,
            request_secs: 10.0,
            exposure_margin_secs: 60.0,
        }
    }
}

impl Timeouts {
    pub fn liveness(&self) -> Duration {
        seconds(self.liveness_secs)
    }

    pub fn coordination(&self) -> Duration {
        seconds(self.coordination_secs)
    }

    pub fn slew(&self) -> Duration {
        seconds(self.slew_secs)
    }

    pub fn shutter(&self) -> Duration {
        seconds(self.shutter_secs)
    }

    pub fn lamp(&self) -> Duration {
        seconds(self.lamp_secs)
    }

    pub fn guider_stop(&self) -> Duration {
        seconds(self.guider_stop_secs)
    }

    pub fn cooler(&self) -> Duration {
        seconds(self.cooler_secs)
    }

    pub fn focus(&self) -> Duration {
        seconds(self.focus_secs)
    }

    pub fn request(&self) -> Duration {
        seconds(self.request_secs)
    }

    pub fn exposure(&self, exp_secs: f64) -> Duration {
        seconds(exp_secs * 2.0 + self.exposure_margin_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: f64,
    pub liveness_timeout_secs: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15.0,
            liveness_timeout_secs: 10.0,
        }
    }
}

/// Names of the vendor automation processes probed for crash detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorProcesses {
    pub camera: String,
    pub telescope: String,
    pub dome: String,
}

impl Default for VendorProcesses {
    fn default() -> Self {
        Self {
            camera: "MaxIm_DL.exe".to_string(),
            telescope: "TheSkyX.exe".to_string(),
            dome: "ASCOMDome.exe".to_string(),
        }
    }
}

impl VendorProcesses {
    pub fn program(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::Camera => Some(&self.camera),
            DeviceKind::Telescope => Some(&self.telescope),
            DeviceKind::Dome => Some(&self.dome),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub site: SiteConfig,
    pub weather_freq_minutes: f64,
    pub min_reopen_minutes: f64,
    /// Remaining window required to reopen after weather clears.
    pub reopen_margin_minutes: f64,
    /// How long before sunset to resume after a daytime wait.
    pub sunset_lead_minutes: f64,
    pub calibration_time: CalibrationTime,
    pub calibration_num: u32,
    pub default_camera: CameraKind,
    pub focus_exposure_multiplier: f64,
    pub filters: BTreeMap<String, u8>,
    pub dark_filter_position: u8,
    pub flat_exposure_secs: BTreeMap<String, f64>,
    pub timeouts: Timeouts,
    pub watchdog: WatchdogConfig,
    /// Granularity of cancellable scheduler sleeps.
    pub poll_interval_secs: f64,
    /// Short pause between dependent hardware commands.
    pub settle_secs: f64,
    /// Pause before startup so the first weather check can complete.
    pub startup_delay_secs: f64,
    pub long_gap_hours: f64,
    pub short_gap_minutes: f64,
    pub guide_step_secs: f64,
    pub continuous_focus_interval_secs: f64,
    pub envelope: SafetyEnvelope,
    pub vendor_processes: VendorProcesses,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        let filters = [("clr", 0), ("uv", 1), ("b", 2), ("v", 3), ("dark", 4), ("r", 5), ("ir", 6), ("Ha", 7)]
            .into_iter()
            .map(|(name, position)| (name.to_string(), position))
            .collect();
        let flat_exposure_secs = [("clr", 3.0), ("uv", 120.0), ("b", 120.0), ("v", 16.0), ("r", 8.0), ("ir", 10.0), ("Ha", 120.0)]
            .into_iter()
            .map(|(name, secs)| (name.to_string(), secs))
            .collect();

        Self {
            site: SiteConfig::default(),
            weather_freq_minutes: 15.0,
            min_reopen_minutes: 30.0,
            reopen_margin_minutes: 15.0,
            sunset_lead_minutes: 5.0,
            calibration_time: CalibrationTime::End,
            calibration_num: 10,
            default_camera: CameraKind::Ccd,
            focus_exposure_multiplier: 0.5,
            filters,
            dark_filter_position: 4,
            flat_exposure_secs,
            timeouts: Timeouts::default(),
            watchdog: WatchdogConfig::default(),
            poll_interval_secs: 10.0,
            settle_secs: 5.0,
            startup_delay_secs: 15.0,
            long_gap_hours: 8.0,
            short_gap_minutes: 5.0,
            guide_step_secs: 5.0,
            continuous_focus_interval_secs: 600.0,
            envelope: SafetyEnvelope::default(),
            vendor_processes: VendorProcesses::default(),
        }
    }
}

impl ObservatoryConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("weather_freq_minutes", self.weather_freq_minutes),
            ("poll_interval_secs", self.poll_interval_secs),
            ("watchdog.interval_secs", self.watchdog.interval_secs),
            ("watchdog.liveness_timeout_secs", self.watchdog.liveness_timeout_secs),
            ("timeouts.liveness_secs", self.timeouts.liveness_secs),
            ("timeouts.slew_secs", self.timeouts.slew_secs),
            ("timeouts.request_secs", self.timeouts.request_secs),
            ("focus_exposure_multiplier", self.focus_exposure_multiplier),
            ("guide_step_secs", self.guide_step_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.min_reopen_minutes < 0.0 || self.reopen_margin_minutes < 0.0 {
            return Err(ConfigError::Invalid("reopen times must not be negative".into()));
        }
        if self.calibration_num == 0 {
            return Err(ConfigError::Invalid("calibration_num must be at least 1".into()));
        }
        if let Some((name, _)) = self.flat_exposure_secs.iter().find(|(_, v)| **v <= 0.0) {
            return Err(ConfigError::Invalid(format!("flat exposure for {name} must be positive")));
        }
        if !(-90.0..=90.0).contains(&self.envelope.altitude_floor_deg) {
            return Err(ConfigError::Invalid("envelope altitude floor must be within [-90, 90]".into()));
        }
        Ok(())
    }

    /// Filter wheel position, matching the name exactly first and then
    /// case-insensitively.
    pub fn filter_position(&self, filter: &str) -> Option<u8> {
        self.filters.get(filter).copied().or_else(|| {
            self.filters
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(filter))
                .map(|(_, position)| *position)
        })
    }

    pub fn flat_exposure(&self, filter: &str) -> Option<f64> {
        self.flat_exposure_secs.get(filter).copied().or_else(|| {
            self.flat_exposure_secs
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(filter))
                .map(|(_, secs)| *secs)
        })
    }

    /// Focus exposure for a ticket whose first exposure is `first_exp_secs`.
    pub fn focus_exposure(&self, first_exp_secs: f64) -> f64 {
        (self.focus_exposure_multiplier * first_exp_secs).clamp(0.001, 30.0)
    }

    pub fn weather_freq(&self) -> Duration {
        seconds(self.weather_freq_minutes * 60.0)
    }

    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval_secs)
    }

    pub fn settle(&self) -> Duration {
        seconds(self.settle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ObservatoryConfig::from_json(r#"{"min_reopen_minutes": 45, "calibration_time": "start"}"#).unwrap();
        assert_eq!(config.min_reopen_minutes, 45.0);
        assert_eq!(config.calibration_time, CalibrationTime::Start);
        assert_eq!(config.weather_freq_minutes, 15.0);
        assert_eq!(config.dark_filter_position, 4);
        assert_eq!(config.flat_exposure("v"), Some(16.0));
        assert_eq!(config.vendor_processes.program(DeviceKind::Camera), Some("MaxIm_DL.exe"));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = ObservatoryConfig::from_json(r#"{"poll_interval_secs": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_focus_exposure_is_clamped() {
        let config = ObservatoryConfig::default();
        assert_eq!(config.focus_exposure(120.0), 30.0);
        assert_eq!(config.focus_exposure(0.0001), 0.001);
        assert_eq!(config.focus_exposure(10.0), 5.0);
    }

    #[test]
    fn test_filter_lookup_ignores_case() {
        let config = ObservatoryConfig::default();
        assert_eq!(config.filter_position("R"), Some(5));
        assert_eq!(config.filter_position("ha"), Some(7));
        assert_eq!(config.filter_position("z"), None);
    }

    #[test]
    fn test_exposure_timeout_scales() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.exposure(30.0), Duration::from_secs(120));
    }
}
