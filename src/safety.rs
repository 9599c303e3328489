use crate::astrometry::{Astrometry, Equatorial};
use crate::devices::DeviceKind;
use chrono::{DateTime, Utc};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_SAFETY_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    TargetRejected,
    CoordinatesUnsafe,
    SlewUnreachable,
    WeatherSuspension,
    WeatherReopen,
    DeviceUnavailable(DeviceKind),
    DeviceCrashed(DeviceKind),
    DeviceRestarted(DeviceKind),
    FocusDisabled,
    CriticalShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp: DateTime<Utc>,
    pub level: SafetyLevel,
}

/// Bounded history of safety-relevant events; the oldest entry is evicted
/// once full.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SafetyLog {
    events: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: SafetyEvent, level: SafetyLevel, timestamp: DateTime<Utc>) {
        // The log never grows past capacity; the oldest record makes room.
        debug_assert!(self.events.len() <= MAX_SAFETY_EVENTS);

        if self.events.is_full() {
            self.events.remove(0);
        }
        let _ = self.events.push(SafetyEventRecord {
            event,
            timestamp,
            level,
        });
    }

    pub fn events(&self) -> &[SafetyEventRecord] {
        &self.events
    }

    pub fn count(&self, event: SafetyEvent) -> usize {
        self.events.iter().filter(|r| r.event == event).count()
    }

    pub fn highest_level(&self) -> Option<SafetyLevel> {
        self.events.iter().map(|r| r.level).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LimitViolation {
    #[error("altitude {altitude_deg:.2} deg is at or below the {floor_deg} deg floor")]
    BelowAltitudeFloor { altitude_deg: f64, floor_deg: f64 },
    #[error("declination {dec_deg:.2} deg exceeds the {ceiling_deg} deg ceiling")]
    DeclinationOutOfRange { dec_deg: f64, ceiling_deg: f64 },
    #[error("hour angle {hour_angle:.2} h exceeds the {limit_hours} h limit")]
    HourAngleOutOfRange { hour_angle: f64, limit_hours: f64 },
}

/// The physically safe pointing envelope, shared by slew-time validation and
/// the watchdog's passive coordinate check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyEnvelope {
    pub altitude_floor_deg: f64,
    pub declination_ceiling_deg: f64,
    pub max_hour_angle_hours: Option<f64>,
}

impl Default for SafetyEnvelope {
    fn default() -> Self {
        Self {
            altitude_floor_deg: 15.0,
            declination_ceiling_deg: 90.0,
            max_hour_angle_hours: None,
        }
    }
}

impl SafetyEnvelope {
    pub fn accepts(&self, altitude_deg: f64, dec_deg: f64) -> bool {
        !(altitude_deg <= self.altitude_floor_deg || dec_deg > self.declination_ceiling_deg)
    }

    pub fn evaluate(&self, altitude_deg: f64, dec_deg: f64, hour_angle: f64) -> Result<(), LimitViolation> {
        if altitude_deg <= self.altitude_floor_deg {
            return Err(LimitViolation::BelowAltitudeFloor {
                altitude_deg,
                floor_deg: self.altitude_floor_deg,
            });
        }
        if dec_deg > self.declination_ceiling_deg {
            return Err(LimitViolation::DeclinationOutOfRange {
                dec_deg,
                ceiling_deg: self.declination_ceiling_deg,
            });
        }
        if let Some(limit_hours) = self.max_hour_angle_hours {
            if hour_angle.abs() > limit_hours {
                return Err(LimitViolation::HourAngleOutOfRange {
                    hour_angle,
                    limit_hours,
                });
            }
        }
        Ok(())
    }

    pub fn check(
        &self,
        target: Equatorial,
        at: DateTime<Utc>,
        astrometry: &dyn Astrometry,
    ) -> Result<(), LimitViolation> {
        self.evaluate(
            astrometry.altitude_deg(target, at),
            target.dec_deg,
            astrometry.hour_angle_hours(target, at),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_safety_log_evicts_oldest() {
        let mut log = SafetyLog::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        log.record(SafetyEvent::WeatherSuspension, SafetyLevel::Warning, t0);
        for _ in 0..MAX_SAFETY_EVENTS {
            log.record(SafetyEvent::WeatherReopen, SafetyLevel::Info, t0);
        }
        assert_eq!(log.events().len(), MAX_SAFETY_EVENTS);
        assert_eq!(log.count(SafetyEvent::WeatherSuspension), 0);
        assert_eq!(log.highest_level(), Some(SafetyLevel::Info));
    }

    #[test]
    fn test_hour_angle_limit_is_optional() {
        let mut envelope = SafetyEnvelope::default();
        assert!(envelope.evaluate(45.0, 10.0, 9.5).is_ok());
        envelope.max_hour_angle_hours = Some(8.75);
        assert!(matches!(
            envelope.evaluate(45.0, 10.0, -9.5),
            Err(LimitViolation::HourAngleOutOfRange { .. })
        ));
    }

    #[test]
    fn test_floor_is_inclusive() {
        let envelope = SafetyEnvelope::default();
        assert!(!envelope.accepts(15.0, 0.0));
        assert!(envelope.accepts(15.0001, 90.0));
        assert!(!envelope.accepts(60.0, 90.0001));
    }
}
