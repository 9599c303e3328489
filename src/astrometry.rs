//! Coordinate helpers. Precise conversions belong to an external provider;
//! `SiteAstrometry` is a low-precision implementation good to a fraction of
//! a degree, which is all the safety envelope needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Equatorial {
    pub ra_hours: f64,
    pub dec_deg: f64,
}

impl Equatorial {
    pub fn new(ra_hours: f64, dec_deg: f64) -> Self {
        Self { ra_hours, dec_deg }
    }

    /// Largest per-axis separation in degrees, with RA scaled to degrees and
    /// wrapped across 0h.
    pub fn axis_separation_deg(&self, other: &Equatorial) -> f64 {
        let mut d_ra = (self.ra_hours - other.ra_hours).abs() % 24.0;
        if d_ra > 12.0 {
            d_ra = 24.0 - d_ra;
        }
        (d_ra * 15.0).max((self.dec_deg - other.dec_deg).abs())
    }
}

pub trait Astrometry: Send + Sync {
    fn altitude_deg(&self, target: Equatorial, at: DateTime<Utc>) -> f64;
    fn hour_angle_hours(&self, target: Equatorial, at: DateTime<Utc>) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteAstrometry {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl SiteAstrometry {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }

    /// Local sidereal time in hours.
    pub fn local_sidereal_hours(&self, at: DateTime<Utc>) -> f64 {
        let days = (at.timestamp_millis() as f64 / 86_400_000.0) - 10_957.5;
        let gmst_hours = 18.697_374_558 + 24.065_709_824_419_08 * days;
        (gmst_hours + self.longitude_deg / 15.0).rem_euclid(24.0)
    }
}

impl Astrometry for SiteAstrometry {
    fn altitude_deg(&self, target: Equatorial, at: DateTime<Utc>) -> f64 {
        let ha = self.hour_angle_hours(target, at).to_radians() * 15.0;
        let dec = target.dec_deg.to_radians();
        let lat = self.latitude_deg.to_radians();
        let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
        sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
    }

    /// Hour angle in (-12, 12].
    fn hour_angle_hours(&self, target: Equatorial, at: DateTime<Utc>) -> f64 {
        let ha = (self.local_sidereal_hours(at) - target.ra_hours).rem_euclid(24.0);
        if ha > 12.0 {
            ha - 24.0
        } else {
            ha
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    #[test]
    fn test_object_on_meridian_culminates() {
        let site = SiteAstrometry::new(40.0, -75.0);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap();
        let target = Equatorial::new(site.local_sidereal_hours(at), 10.0);
        assert_abs_diff_eq!(site.hour_angle_hours(target, at), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(site.altitude_deg(target, at), 60.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pole_altitude_equals_latitude() {
        let site = SiteAstrometry::new(40.0, -75.0);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap();
        assert_abs_diff_eq!(site.altitude_deg(Equatorial::new(3.0, 90.0), at), 40.0, epsilon = 1e-6);
    }

    #[test]
    fn test_axis_separation_wraps_ra() {
        let a = Equatorial::new(23.9, 10.0);
        let b = Equatorial::new(0.1, 10.5);
        assert_abs_diff_eq!(a.axis_separation_deg(&b), 3.0, epsilon = 1e-9);
    }
}
