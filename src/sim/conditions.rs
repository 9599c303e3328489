use super::{Event, EventLog};
use crate::astrometry::{Astrometry, Equatorial};
use crate::clock::Clock;
use crate::conditions::Conditions;
use crate::devices::{ProcessMonitor, TrackingRates};
use crate::satellite::{SatelliteCatalog, SatelliteEphemeris};
use crate::signal::lock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Window = (DateTime<Utc>, DateTime<Utc>);

fn within(windows: &[Window], at: DateTime<Utc>) -> bool {
    windows.iter().any(|(start, end)| *start <= at && at < *end)
}

/// Weather and daylight driven by scripted windows on the run clock.
pub struct ScriptedConditions {
    clock: Arc<dyn Clock>,
    events: EventLog,
    alerts: Mutex<Vec<Window>>,
    daylight: Mutex<Vec<Window>>,
}

impl ScriptedConditions {
    pub fn new(clock: Arc<dyn Clock>, events: EventLog) -> Self {
        Self {
            clock,
            events,
            alerts: Mutex::new(Vec::new()),
            daylight: Mutex::new(Vec::new()),
        }
    }

    /// Raises a weather alert for `[start, end)`.
    pub fn add_alert(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        lock(&self.alerts).push((start, end));
    }

    /// Marks `[sunrise, sunset)` as daytime.
    pub fn add_daylight(&self, sunrise: DateTime<Utc>, sunset: DateTime<Utc>) {
        lock(&self.daylight).push((sunrise, sunset));
    }
}

impl Conditions for ScriptedConditions {
    fn weather_alert(&self) -> bool {
        self.events.record(Event::WeatherPolled);
        within(&lock(&self.alerts), self.clock.now())
    }

    fn is_daytime(&self, at: DateTime<Utc>) -> bool {
        within(&lock(&self.daylight), at)
    }

    /// Without scripted daylight the sun sets a day later.
    fn next_sunset(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        lock(&self.daylight)
            .iter()
            .map(|(_, sunset)| *sunset)
            .filter(|sunset| *sunset > after)
            .min()
            .unwrap_or_else(|| after + ChronoDuration::days(1))
    }
}

/// Sky where every target sits at a fixed altitude and hour angle.
#[derive(Debug)]
pub struct FixedSky {
    altitude_deg: Mutex<f64>,
    hour_angle_hours: Mutex<f64>,
}

impl Default for FixedSky {
    fn default() -> Self {
        Self {
            altitude_deg: Mutex::new(60.0),
            hour_angle_hours: Mutex::new(0.0),
        }
    }
}

impl FixedSky {
    pub fn set_altitude(&self, altitude_deg: f64) {
        *lock(&self.altitude_deg) = altitude_deg;
    }

    pub fn set_hour_angle(&self, hour_angle_hours: f64) {
        *lock(&self.hour_angle_hours) = hour_angle_hours;
    }
}

impl Astrometry for FixedSky {
    fn altitude_deg(&self, _target: Equatorial, _at: DateTime<Utc>) -> f64 {
        *lock(&self.altitude_deg)
    }

    fn hour_angle_hours(&self, _target: Equatorial, _at: DateTime<Utc>) -> f64 {
        *lock(&self.hour_angle_hours)
    }
}

/// A satellite moving at constant rates from a reference position.
#[derive(Debug, Clone, Copy)]
pub struct LinearSatellite {
    pub epoch: DateTime<Utc>,
    pub origin: Equatorial,
    /// Arcseconds per second.
    pub rates: TrackingRates,
}

impl SatelliteEphemeris for LinearSatellite {
    fn position(&self, at: DateTime<Utc>) -> Equatorial {
        let dt = (at - self.epoch).num_milliseconds() as f64 / 1000.0;
        let ra_hours = self.origin.ra_hours + self.rates.ra * dt / 3600.0 / 15.0;
        let dec_deg = self.origin.dec_deg + self.rates.dec * dt / 3600.0;
        Equatorial::new(ra_hours.rem_euclid(24.0), dec_deg.clamp(-90.0, 90.0))
    }

    fn rates(&self, _at: DateTime<Utc>) -> TrackingRates {
        self.rates
    }
}

#[derive(Default)]
pub struct SimCatalog {
    satellites: Mutex<HashMap<String, Arc<dyn SatelliteEphemeris>>>,
}

impl SimCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, designator: &str, ephemeris: Arc<dyn SatelliteEphemeris>) {
        lock(&self.satellites).insert(designator.to_string(), ephemeris);
    }
}

impl SatelliteCatalog for SimCatalog {
    fn lookup(&self, designator: &str) -> Option<Arc<dyn SatelliteEphemeris>> {
        lock(&self.satellites).get(designator).cloned()
    }
}

/// Vendor processes that respond unless told to hang.
pub struct SimProcesses {
    events: EventLog,
    hung: Mutex<HashMap<String, u32>>,
}

impl SimProcesses {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            hung: Mutex::new(HashMap::new()),
        }
    }

    /// The next `probes` responsiveness checks of `program` fail.
    pub fn fail_next(&self, program: &str, probes: u32) {
        *lock(&self.hung).entry(program.to_string()).or_insert(0) += probes;
    }
}

impl ProcessMonitor for SimProcesses {
    fn is_responding(&self, program: &str) -> bool {
        match lock(&self.hung).get_mut(program) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                false
            }
            _ => true,
        }
    }

    fn terminate(&self, program: &str) {
        self.events.record(Event::ProcessTerminated(program.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClock;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    #[test]
    fn test_alert_window_follows_clock() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let clock = Arc::new(SimClock::new(start));
        let events = EventLog::new();
        let conditions = ScriptedConditions::new(clock.clone(), events.clone());
        conditions.add_alert(start + ChronoDuration::minutes(10), start + ChronoDuration::minutes(20));

        assert!(!conditions.weather_alert());
        clock.set(start + ChronoDuration::minutes(15));
        assert!(conditions.weather_alert());
        clock.set(start + ChronoDuration::minutes(20));
        assert!(!conditions.weather_alert());
        assert_eq!(events.count(|e| *e == Event::WeatherPolled), 3);
    }

    #[test]
    fn test_next_sunset_uses_daylight_windows() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let conditions = ScriptedConditions::new(Arc::new(SimClock::new(start)), EventLog::new());
        let sunset = start + ChronoDuration::hours(6);
        conditions.add_daylight(start - ChronoDuration::hours(6), sunset);
        assert!(conditions.is_daytime(start));
        assert_eq!(conditions.next_sunset(start), sunset);
        assert_eq!(conditions.next_sunset(sunset), sunset + ChronoDuration::days(1));
    }

    #[test]
    fn test_linear_satellite_moves_at_its_rates() {
        let epoch = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let satellite = LinearSatellite {
            epoch,
            origin: Equatorial::new(10.0, 20.0),
            rates: TrackingRates::new(54.0, 36.0),
        };
        let later = satellite.position(epoch + ChronoDuration::seconds(100));
        assert_abs_diff_eq!(later.ra_hours, 10.1, epsilon = 1e-9);
        assert_abs_diff_eq!(later.dec_deg, 21.0, epsilon = 1e-9);
    }

    #[test]
    fn test_hung_process_recovers_after_probes() {
        let processes = SimProcesses::new(EventLog::new());
        processes.fail_next("TheSkyX.exe", 2);
        assert!(!processes.is_responding("TheSkyX.exe"));
        assert!(!processes.is_responding("TheSkyX.exe"));
        assert!(processes.is_responding("TheSkyX.exe"));
        assert!(processes.is_responding("MaxIm_DL.exe"));
    }
}
