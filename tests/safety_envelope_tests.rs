use chrono::{TimeZone, Utc};
use observatory::astrometry::{Astrometry, Equatorial};
use observatory::safety::{LimitViolation, SafetyEnvelope, SafetyEvent, SafetyLevel, SafetyLog};
use observatory::sim::FixedSky;

#[test]
fn test_accepts_matches_floor_and_ceiling_everywhere() {
    let envelope = SafetyEnvelope::default();
    for alt in (-90..=90).map(f64::from) {
        for dec in (-95..=95).map(f64::from) {
            let expected = !(alt <= 15.0 || dec > 90.0);
            assert_eq!(envelope.accepts(alt, dec), expected, "alt={alt} dec={dec}");
            assert_eq!(envelope.evaluate(alt, dec, 0.0).is_ok(), expected, "alt={alt} dec={dec}");
        }
    }
}

#[test]
fn test_floor_is_rejected_exactly() {
    let envelope = SafetyEnvelope::default();
    assert!(!envelope.accepts(15.0, 0.0));
    assert!(envelope.accepts(15.001, 0.0));
    assert!(envelope.accepts(45.0, 90.0));
    assert!(!envelope.accepts(45.0, 90.001));
}

#[test]
fn test_altitude_is_checked_before_declination() {
    let envelope = SafetyEnvelope::default();
    assert!(matches!(
        envelope.evaluate(10.0, 95.0, 0.0),
        Err(LimitViolation::BelowAltitudeFloor { .. })
    ));
    assert!(matches!(
        envelope.evaluate(40.0, 95.0, 0.0),
        Err(LimitViolation::DeclinationOutOfRange { .. })
    ));
}

#[test]
fn test_check_uses_astrometry_for_the_target() {
    let sky = FixedSky::default();
    let envelope = SafetyEnvelope {
        max_hour_angle_hours: Some(6.0),
        ..SafetyEnvelope::default()
    };
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    let target = Equatorial::new(16.69, 36.46);
    assert!(envelope.check(target, at, &sky).is_ok());

    sky.set_hour_angle(-6.5);
    assert!(matches!(
        envelope.check(target, at, &sky),
        Err(LimitViolation::HourAngleOutOfRange { .. })
    ));

    sky.set_hour_angle(0.0);
    sky.set_altitude(12.0);
    assert_eq!(sky.altitude_deg(target, at), 12.0);
    let violation = envelope.check(target, at, &sky).unwrap_err();
    assert!(violation.to_string().contains("floor"));
}

#[test]
fn test_safety_log_tracks_highest_level() {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    let mut log = SafetyLog::new();
    log.record(SafetyEvent::TargetRejected, SafetyLevel::Warning, at);
    log.record(SafetyEvent::CriticalShutdown, SafetyLevel::Critical, at);
    log.record(SafetyEvent::WeatherReopen, SafetyLevel::Info, at);
    assert_eq!(log.highest_level(), Some(SafetyLevel::Critical));
    assert_eq!(log.count(SafetyEvent::TargetRejected), 1);
}
