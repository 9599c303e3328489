use approx::assert_relative_eq;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use observatory::astrometry::Equatorial;
use observatory::devices::TrackingRates;
use observatory::parse_tickets;
use observatory::satellite::{
    follow_check, fov_transit_seconds, lead_compensated_time, pointing_tolerance_deg, streak_plan,
    FollowAction, TrackingMode, FOLLOW_CHECK_SECS, RESLEW_SETTLE_SECS,
};

const CCD_FOV: f64 = 26.0;

#[test]
fn test_transit_uses_the_faster_axis() {
    for rate in [1.0, 12.5, 30.0, 240.0] {
        assert_relative_eq!(fov_transit_seconds(rate, rate, CCD_FOV), CCD_FOV / (rate / 60.0));
    }
    assert_relative_eq!(fov_transit_seconds(30.0, 15.0, CCD_FOV), 52.0);
    assert_relative_eq!(fov_transit_seconds(-30.0, 10.0, CCD_FOV), 52.0);
    assert_relative_eq!(fov_transit_seconds(5.0, -60.0, 10.0), 10.0);
}

#[test]
fn test_lead_adds_slew_time() {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    assert_eq!(lead_compensated_time(now, 3.0), now + ChronoDuration::seconds(3));
    assert_eq!(lead_compensated_time(now, -1.0), now);
}

#[test]
fn test_stationary_lead_aims_half_a_transit_ahead() {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    let plan = streak_plan(TrackingMode::StationaryLead, now, TrackingRates::new(30.0, 15.0), CCD_FOV);
    assert_eq!(plan.aim_time, now + ChronoDuration::seconds(26 + 3));
    assert_eq!(plan.rates, None);
    assert_relative_eq!(plan.wait_secs, 52.0);
}

#[test]
fn test_half_rate_tracks_at_half_speed() {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
    let plan = streak_plan(TrackingMode::HalfRate, now, TrackingRates::new(30.0, -15.0), CCD_FOV);
    assert_eq!(plan.rates, Some(TrackingRates::new(15.0, -7.5)));
    assert_eq!(plan.aim_time, now + ChronoDuration::seconds(26 + 3));
    assert_relative_eq!(plan.wait_secs, 104.0);
}

#[test]
fn test_follow_reslews_when_pointing_drifts() {
    let rates = TrackingRates::new(30.0, 15.0);
    let satellite = Equatorial::new(10.0, 20.0);
    let drifted = Equatorial::new(10.1, 20.0);
    let action = follow_check(drifted, rates, satellite, rates, CCD_FOV);
    assert_eq!(action, FollowAction::Reslew);
    assert_relative_eq!(action.wait_secs(), RESLEW_SETTLE_SECS as f64);
}

#[test]
fn test_follow_separation_wraps_through_zero_hours() {
    let rates = TrackingRates::new(30.0, 15.0);
    let action = follow_check(
        Equatorial::new(23.99, 20.0),
        rates,
        Equatorial::new(0.01, 20.0),
        rates,
        CCD_FOV,
    );
    assert_eq!(action, FollowAction::Hold);
    assert_relative_eq!(action.wait_secs(), FOLLOW_CHECK_SECS as f64);
}

#[test]
fn test_follow_adjusts_rates_at_tolerance() {
    let position = Equatorial::new(10.0, 20.0);
    let satellite_rates = TrackingRates::new(0.0005, 0.0);
    let action = follow_check(position, TrackingRates::default(), position, satellite_rates, CCD_FOV);
    assert_eq!(action, FollowAction::AdjustRates(satellite_rates));

    let close = TrackingRates::new(0.0001, 0.0);
    let action = follow_check(position, TrackingRates::default(), position, close, CCD_FOV);
    assert_eq!(action, FollowAction::Hold);
}

#[test]
fn test_tolerance_scales_with_field_of_view() {
    assert!(pointing_tolerance_deg(10.0) < pointing_tolerance_deg(CCD_FOV));
    assert_relative_eq!(pointing_tolerance_deg(2.0), 5.0 / 60.0);
}

#[test]
fn test_ticket_tracking_mode_defaults_to_stationary_lead() {
    let tickets = parse_tickets(
        r#"[
            {"name": "ISS", "start_time": "2024-03-01T02:00:00+00:00",
             "end_time": "2024-03-01T02:10:00+00:00", "filter": "clr",
             "exp_time": 1.0, "num": 5, "satellite_tracking": true},
            {"name": "ISS", "start_time": "2024-03-01T02:00:00+00:00",
             "end_time": "2024-03-01T02:10:00+00:00", "filter": "clr",
             "exp_time": 1.0, "num": 5, "satellite_tracking": true,
             "satellite_tracking_mode": 2}
        ]"#,
    )
    .unwrap();
    assert_eq!(tickets[0].tracking_mode(), Some(TrackingMode::StationaryLead));
    assert_eq!(tickets[0].image_prefix(), "ISS_Mode1");
    assert_eq!(tickets[1].tracking_mode(), Some(TrackingMode::ContinuousFollow));
}
