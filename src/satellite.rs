//! Satellite tracking timing.
//!
//! Rates are in arcseconds per second, fields of view in arcminutes. The
//! functions here are pure; the scheduler feeds them ephemeris samples and
//! acts on the plans they return.

use crate::astrometry::Equatorial;
use crate::devices::TrackingRates;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::Arc;
use thiserror::Error;

/// Typical slew latency folded into every aim point.
pub const SLEW_TIME_SECS: f64 = 3.0;
/// Continuous-follow re-check cadence.
pub const FOLLOW_CHECK_SECS: u64 = 15;
/// Wait after a forced continuous-follow re-slew.
pub const RESLEW_SETTLE_SECS: u64 = 60;
pub const RATE_TOLERANCE: f64 = 0.0005;
pub const MIN_POINTING_TOLERANCE_ARCMIN: f64 = 5.0;
/// Upper bound on any streak wait, for nearly stationary targets.
pub const MAX_TRANSIT_WAIT_SECS: f64 = 3600.0;

const_assert!(FOLLOW_CHECK_SECS < RESLEW_SETTLE_SECS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrackingMode {
    /// Lead the satellite and hold still; the satellite streaks.
    StationaryLead = 1,
    /// Follow the satellite at its rate; the stars streak.
    ContinuousFollow = 2,
    /// Like `StationaryLead` but tracking at half the satellite rate.
    HalfRate = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown satellite tracking mode {0}")]
pub struct UnknownTrackingMode(pub u8);

impl TryFrom<u8> for TrackingMode {
    type Error = UnknownTrackingMode;

    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        match mode {
            1 => Ok(TrackingMode::StationaryLead),
            2 => Ok(TrackingMode::ContinuousFollow),
            3 => Ok(TrackingMode::HalfRate),
            other => Err(UnknownTrackingMode(other)),
        }
    }
}

impl From<TrackingMode> for u8 {
    fn from(mode: TrackingMode) -> u8 {
        mode as u8
    }
}

pub trait SatelliteEphemeris: Send + Sync {
    fn position(&self, at: DateTime<Utc>) -> Equatorial;
    fn rates(&self, at: DateTime<Utc>) -> TrackingRates;
}

pub trait SatelliteCatalog: Send + Sync {
    fn lookup(&self, designator: &str) -> Option<Arc<dyn SatelliteEphemeris>>;
}

/// Seconds for a target moving at the larger of the two rates to cross the
/// field of view. Infinite for a stationary target.
pub fn fov_transit_seconds(ra_rate: f64, dec_rate: f64, fov_arcmin: f64) -> f64 {
    let max_rate_arcmin = ra_rate.abs().max(dec_rate.abs()) / 60.0;
    if max_rate_arcmin > 0.0 {
        fov_arcmin / max_rate_arcmin
    } else {
        f64::INFINITY
    }
}

pub fn lead_compensated_time(base: DateTime<Utc>, slew_duration_secs: f64) -> DateTime<Utc> {
    base + to_chrono(slew_duration_secs)
}

fn to_chrono(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs.clamp(0.0, MAX_TRANSIT_WAIT_SECS) * 1000.0).round() as i64)
}

/// A streak (mode 1 or 3) step: where to aim, what rates to set, and how long
/// to wait before the next step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreakPlan {
    pub aim_time: DateTime<Utc>,
    pub rates: Option<TrackingRates>,
    pub wait_secs: f64,
}

/// Plans the next streak step. The aim point is half a transit ahead so the
/// satellite crosses the centre of the frame, pushed out by the slew time.
pub fn streak_plan(mode: TrackingMode, now: DateTime<Utc>, rates: TrackingRates, fov_arcmin: f64) -> StreakPlan {
    let transit = fov_transit_seconds(rates.ra, rates.dec, fov_arcmin);
    let half_transit = if transit.is_finite() { transit / 2.0 } else { 0.0 };
    let aim_time = lead_compensated_time(now + to_chrono(half_transit), SLEW_TIME_SECS);

    let (rates, wait) = match mode {
        TrackingMode::HalfRate => {
            let half = rates.scaled(0.5);
            (Some(half), fov_transit_seconds(half.ra, half.dec, fov_arcmin))
        }
        TrackingMode::StationaryLead | TrackingMode::ContinuousFollow => (None, transit),
    };

    StreakPlan {
        aim_time,
        rates,
        wait_secs: wait.min(MAX_TRANSIT_WAIT_SECS),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FollowAction {
    /// Pointing drifted too far; slew again and reset rates.
    Reslew,
    AdjustRates(TrackingRates),
    Hold,
}

impl FollowAction {
    /// Seconds until the next continuous-follow check.
    pub fn wait_secs(&self) -> f64 {
        match self {
            FollowAction::Reslew => RESLEW_SETTLE_SECS as f64,
            FollowAction::AdjustRates(_) | FollowAction::Hold => FOLLOW_CHECK_SECS as f64,
        }
    }
}

/// Pointing tolerance for continuous follow, in degrees.
pub fn pointing_tolerance_deg(fov_arcmin: f64) -> f64 {
    (2.0 * fov_arcmin).max(MIN_POINTING_TOLERANCE_ARCMIN) / 60.0
}

/// Decides the continuous-follow correction from telescope and satellite state.
pub fn follow_check(
    telescope: Equatorial,
    telescope_rates: TrackingRates,
    satellite: Equatorial,
    satellite_rates: TrackingRates,
    fov_arcmin: f64,
) -> FollowAction {
    if telescope.axis_separation_deg(&satellite) >= pointing_tolerance_deg(fov_arcmin) {
        return FollowAction::Reslew;
    }
    if (telescope_rates.ra - satellite_rates.ra).abs() >= RATE_TOLERANCE
        || (telescope_rates.dec - satellite_rates.dec).abs() >= RATE_TOLERANCE
    {
        return FollowAction::AdjustRates(satellite_rates);
    }
    FollowAction::Hold
}
