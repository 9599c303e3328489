//! Simulated observatory.
//!
//! Scripted drivers, weather, sky, satellites and vendor processes that run
//! on a virtual clock. Every device action is appended to a shared
//! [`EventLog`] so runs can be checked step by step.

pub mod conditions;
pub mod drivers;
pub mod faults;

pub use conditions::{FixedSky, LinearSatellite, ScriptedConditions, SimCatalog, SimProcesses};
pub use drivers::SimDrivers;
pub use faults::{FaultInjectionConfig, FaultInjector, FaultKind, Operation};

use crate::astrometry::Equatorial;
use crate::clock::Clock;
use crate::devices::{CameraKind, DeviceKind, FrameType, ShutterCommand, SlewStatus, TrackingRates};
use crate::scheduler::Environment;
use crate::signal::lock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected(DeviceKind),
    Disconnected(DeviceKind),
    Exposure {
        camera: CameraKind,
        path: PathBuf,
        filter_position: u8,
        duration_secs: f64,
        frame: FrameType,
    },
    Cooler(bool),
    CoolerSettled,
    CaptureStarted,
    CapturePaused,
    CaptureResumed,
    CaptureStopped,
    Slew {
        target: Equatorial,
        status: SlewStatus,
    },
    TelescopePark,
    TelescopeUnpark,
    TrackingRates(TrackingRates),
    Shutter(ShutterCommand),
    DomeHome,
    DomePark,
    DomeSlaved(bool),
    AutoFocus,
    FocusTo(i32),
    GuideStep,
    MirrorPort(CameraKind),
    Lamp(bool),
    WeatherPolled,
    ProcessTerminated(String),
}

/// Shared, append-only record of simulated device activity.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        lock(&self.0).push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        lock(&self.0).iter().filter(|e| predicate(e)).count()
    }

    /// Index of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        lock(&self.0).iter().position(predicate)
    }

    /// Light frames in the order they were taken.
    pub fn light_frames(&self) -> Vec<(CameraKind, PathBuf, u8)> {
        lock(&self.0)
            .iter()
            .filter_map(|event| match event {
                Event::Exposure {
                    camera,
                    path,
                    filter_position,
                    frame: FrameType::Light,
                    ..
                } => Some((*camera, path.clone(), *filter_position)),
                _ => None,
            })
            .collect()
    }
}

/// Virtual time. Sleeping advances the clock immediately.
#[derive(Debug)]
pub struct SimClock {
    now: Mutex<DateTime<Utc>>,
}

impl SimClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
        let mut now = lock(&self.now);
        *now = *now + step;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Let actor threads run between virtual steps.
        thread::yield_now();
    }
}

/// A complete simulated site.
pub struct SimWorld {
    pub clock: Arc<SimClock>,
    pub events: EventLog,
    pub drivers: Arc<SimDrivers>,
    pub conditions: Arc<ScriptedConditions>,
    pub sky: Arc<FixedSky>,
    pub satellites: Arc<SimCatalog>,
    pub processes: Arc<SimProcesses>,
}

impl SimWorld {
    pub fn new(start: DateTime<Utc>) -> Self {
        let clock = Arc::new(SimClock::new(start));
        let events = EventLog::new();
        Self {
            drivers: Arc::new(SimDrivers::new(Arc::clone(&clock), events.clone())),
            conditions: Arc::new(ScriptedConditions::new(
                Arc::clone(&clock) as Arc<dyn Clock>,
                events.clone(),
            )),
            sky: Arc::new(FixedSky::default()),
            satellites: Arc::new(SimCatalog::new()),
            processes: Arc::new(SimProcesses::new(events.clone())),
            clock,
            events,
        }
    }

    pub fn environment(&self) -> Environment {
        Environment {
            drivers: Arc::clone(&self.drivers) as _,
            clock: Arc::clone(&self.clock) as _,
            conditions: Arc::clone(&self.conditions) as _,
            astrometry: Arc::clone(&self.sky) as _,
            satellites: Arc::clone(&self.satellites) as _,
            processes: Arc::clone(&self.processes) as _,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sim_clock_sleep_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let clock = SimClock::new(start);
        clock.sleep(Duration::from_secs(90));
        assert_eq!(clock.now() - start, ChronoDuration::seconds(90));
    }

    #[test]
    fn test_event_log_is_shared() {
        let log = EventLog::new();
        let other = log.clone();
        other.record(Event::DomeHome);
        other.record(Event::Lamp(true));
        assert_eq!(log.count(|e| matches!(e, Event::Lamp(_))), 1);
        assert_eq!(log.position(|e| *e == Event::Lamp(true)), Some(1));
    }
}
