//! Hardware health monitor.
//!
//! Runs on its own thread, polls every registered device actor for liveness
//! and samples the telescope position against the safety envelope. It only
//! reports: restarting crashed devices is the scheduler's job.

use crate::actor::{ActorHealth, DeviceControl};
use crate::astrometry::{Astrometry, Equatorial};
use crate::clock::{seconds, Clock};
use crate::config::WatchdogConfig;
use crate::devices::{DeviceKind, MAX_DEVICES};
use crate::safety::SafetyEnvelope;
use crate::signal::{lock, Signal};
use chrono::{DateTime, Utc};
use heapless::{FnvIndexMap, Vec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Something that can report where the telescope is pointing.
pub trait PositionSource: Send + Sync {
    fn is_connected(&self) -> bool;
    fn sample(&self, timeout: Duration) -> Option<Equatorial>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinateCheck {
    Active,
    /// Suspended until the deadline, or until resumed when `None`.
    Suspended { until: Option<DateTime<Utc>> },
}

/// The watchdog's view of the hardware at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub crashed: Vec<DeviceKind, MAX_DEVICES>,
    pub coordinates_safe: bool,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.crashed.is_empty() && self.coordinates_safe
    }
}

struct Inner {
    registry: Mutex<FnvIndexMap<DeviceKind, Arc<dyn DeviceControl>, MAX_DEVICES>>,
    ignored: Mutex<FnvIndexMap<DeviceKind, Option<DateTime<Utc>>, MAX_DEVICES>>,
    crashed: Mutex<Vec<DeviceKind, MAX_DEVICES>>,
    coordinate_check: Mutex<CoordinateCheck>,
    position: Mutex<Option<Arc<dyn PositionSource>>>,
    coordinates_safe: AtomicBool,
    stop: Signal,
    clock: Arc<dyn Clock>,
    astrometry: Arc<dyn Astrometry>,
    envelope: SafetyEnvelope,
    settings: WatchdogConfig,
}

pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(
        settings: WatchdogConfig,
        envelope: SafetyEnvelope,
        clock: Arc<dyn Clock>,
        astrometry: Arc<dyn Astrometry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(FnvIndexMap::new()),
                ignored: Mutex::new(FnvIndexMap::new()),
                crashed: Mutex::new(Vec::new()),
                coordinate_check: Mutex::new(CoordinateCheck::Suspended { until: None }),
                position: Mutex::new(None),
                coordinates_safe: AtomicBool::new(true),
                stop: Signal::new(),
                clock,
                astrometry,
                envelope,
                settings,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the polling thread. Calling it again while running is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }
        self.inner.stop.clear();
        let inner = Arc::clone(&self.inner);
        let interval = seconds(self.inner.settings.interval_secs);
        *thread = Some(thread::Builder::new().name("watchdog".into()).spawn(move || {
            info!(interval_secs = interval.as_secs_f64(), "Watchdog started");
            while !inner.stop.wait(interval) {
                inner.poll_once();
            }
            debug!("Watchdog thread exiting");
        })?);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop.set();
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }
    }

    /// Adds or replaces the actor watched for `kind`.
    pub fn register(&self, control: Arc<dyn DeviceControl>) {
        let kind = control.kind();
        if lock(&self.inner.registry).insert(kind, control).is_err() {
            error!(%kind, "Watchdog registry full");
        }
    }

    pub fn unregister(&self, kind: DeviceKind) {
        lock(&self.inner.registry).remove(&kind);
    }

    /// Skips `kind` during polls until `resume` is called.
    pub fn ignore(&self, kind: DeviceKind) {
        let _ = lock(&self.inner.ignored).insert(kind, None);
    }

    /// Skips `kind` during polls until `duration` has passed on the run clock.
    pub fn ignore_for(&self, kind: DeviceKind, duration: Duration) {
        let until = self.inner.clock.now() + to_chrono(duration);
        let _ = lock(&self.inner.ignored).insert(kind, Some(until));
    }

    pub fn resume(&self, kind: DeviceKind) {
        lock(&self.inner.ignored).remove(&kind);
    }

    pub fn is_ignored(&self, kind: DeviceKind) -> bool {
        self.inner.is_ignored(kind, self.inner.clock.now())
    }

    /// Stops validating the telescope position, for `duration` or until
    /// resumed. Crash detection keeps running.
    pub fn suspend_coordinate_check(&self, duration: Option<Duration>) {
        let until = duration.map(|d| self.inner.clock.now() + to_chrono(d));
        *lock(&self.inner.coordinate_check) = CoordinateCheck::Suspended { until };
    }

    pub fn resume_coordinate_check(&self) {
        *lock(&self.inner.coordinate_check) = CoordinateCheck::Active;
    }

    pub fn coordinate_check_active(&self) -> bool {
        self.inner.coordinate_check_active(self.inner.clock.now())
    }

    pub fn set_position_source(&self, source: Arc<dyn PositionSource>) {
        *lock(&self.inner.position) = Some(source);
    }

    /// Runs one poll on the calling thread.
    pub fn poll_once(&self) {
        self.inner.poll_once();
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            crashed: lock(&self.inner.crashed).clone(),
            coordinates_safe: self.inner.coordinates_safe.load(Ordering::SeqCst),
        }
    }

    pub fn coordinates_safe(&self) -> bool {
        self.inner.coordinates_safe.load(Ordering::SeqCst)
    }

    /// Drains and returns the crashed set.
    pub fn take_crashed(&self) -> Vec<DeviceKind, MAX_DEVICES> {
        core::mem::take(&mut *lock(&self.inner.crashed))
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn is_ignored(&self, kind: DeviceKind, now: DateTime<Utc>) -> bool {
        let mut ignored = lock(&self.ignored);
        match ignored.get(&kind) {
            Some(None) => true,
            Some(Some(until)) if now < *until => true,
            Some(Some(_)) => {
                ignored.remove(&kind);
                false
            }
            None => false,
        }
    }

    fn coordinate_check_active(&self, now: DateTime<Utc>) -> bool {
        let mut check = lock(&self.coordinate_check);
        match *check {
            CoordinateCheck::Active => true,
            CoordinateCheck::Suspended { until: Some(until) } if now >= until => {
                *check = CoordinateCheck::Active;
                true
            }
            CoordinateCheck::Suspended { .. } => false,
        }
    }

    fn poll_once(&self) {
        let now = self.clock.now();
        let timeout = seconds(self.settings.liveness_timeout_secs);
        // Liveness waits can block, so never hold the registry lock across them.
        let actors: std::vec::Vec<Arc<dyn DeviceControl>> =
            lock(&self.registry).values().cloned().collect();

        for actor in actors {
            let kind = actor.kind();
            if self.is_ignored(kind, now) {
                continue;
            }
            if actor.health(timeout) == ActorHealth::Dead {
                let mut crashed = lock(&self.crashed);
                if !crashed.contains(&kind) {
                    error!(%kind, "Device unresponsive; marking crashed");
                    actor.mark_crashed();
                    // Capacity covers every DeviceKind.
                    let _ = crashed.push(kind);
                }
            }
        }

        self.check_coordinates(now, timeout);
    }

    fn check_coordinates(&self, now: DateTime<Utc>, timeout: Duration) {
        if !self.coordinate_check_active(now) {
            return;
        }
        let Some(source) = lock(&self.position).clone() else {
            return;
        };
        if !source.is_connected() {
            return;
        }
        let Some(position) = source.sample(timeout) else {
            warn!("Telescope position unavailable");
            return;
        };
        if let Err(violation) = self.envelope.check(position, now, self.astrometry.as_ref()) {
            error!(
                ra = position.ra_hours,
                dec = position.dec_deg,
                %violation,
                "CRITICAL: telescope outside the safe envelope"
            );
            self.coordinates_safe.store(false, Ordering::SeqCst);
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(7))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorError, ConnectionState};
    use crate::clock::SystemClock;
    use crate::sim::SimClock;
    use chrono::TimeZone;

    struct FakeControl {
        kind: DeviceKind,
        health: Mutex<ActorHealth>,
        marked: AtomicBool,
    }

    impl FakeControl {
        fn new(kind: DeviceKind, health: ActorHealth) -> Arc<Self> {
            Arc::new(Self {
                kind,
                health: Mutex::new(health),
                marked: AtomicBool::new(false),
            })
        }
    }

    impl DeviceControl for FakeControl {
        fn kind(&self) -> DeviceKind {
            self.kind
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
        fn health(&self, _timeout: Duration) -> ActorHealth {
            *lock(&self.health)
        }
        fn is_alive(&self, _timeout: Duration) -> bool {
            *lock(&self.health) == ActorHealth::Alive
        }
        fn mark_crashed(&self) {
            self.marked.store(true, Ordering::SeqCst);
        }
        fn clear_crashed(&self) {}
        fn disconnect(&self) -> Result<(), ActorError> {
            Ok(())
        }
        fn stop(&self) {}
        fn wait_terminated(&self, _timeout: Duration) -> bool {
            true
        }
    }

    struct FixedPosition(Equatorial);

    impl PositionSource for FixedPosition {
        fn is_connected(&self) -> bool {
            true
        }
        fn sample(&self, _timeout: Duration) -> Option<Equatorial> {
            Some(self.0)
        }
    }

    struct FlatSky(f64);

    impl Astrometry for FlatSky {
        fn altitude_deg(&self, _target: Equatorial, _at: DateTime<Utc>) -> f64 {
            self.0
        }
        fn hour_angle_hours(&self, _target: Equatorial, _at: DateTime<Utc>) -> f64 {
            0.0
        }
    }

    fn watchdog(altitude: f64) -> Watchdog {
        Watchdog::new(
            WatchdogConfig {
                interval_secs: 0.01,
                liveness_timeout_secs: 0.01,
            },
            SafetyEnvelope::default(),
            Arc::new(SystemClock),
            Arc::new(FlatSky(altitude)),
        )
    }

    #[test]
    fn test_dead_actor_joins_crashed_set_once() {
        let wd = watchdog(45.0);
        let dead = FakeControl::new(DeviceKind::Dome, ActorHealth::Dead);
        wd.register(dead.clone());
        wd.register(FakeControl::new(DeviceKind::Camera, ActorHealth::Alive));
        wd.poll_once();
        wd.poll_once();
        assert!(dead.marked.load(Ordering::SeqCst));
        assert_eq!(wd.health().crashed.as_slice(), &[DeviceKind::Dome]);
        assert_eq!(wd.take_crashed().as_slice(), &[DeviceKind::Dome]);
        assert!(wd.health().crashed.is_empty());
    }

    #[test]
    fn test_ignored_kind_is_skipped() {
        let wd = watchdog(45.0);
        wd.register(FakeControl::new(DeviceKind::Telescope, ActorHealth::Dead));
        wd.ignore(DeviceKind::Telescope);
        wd.poll_once();
        assert!(wd.health().crashed.is_empty());
        wd.resume(DeviceKind::Telescope);
        wd.poll_once();
        assert_eq!(wd.health().crashed.len(), 1);
    }

    #[test]
    fn test_coordinate_check_starts_suspended_and_latches() {
        let wd = watchdog(5.0);
        wd.set_position_source(Arc::new(FixedPosition(Equatorial::new(1.0, 20.0))));
        wd.poll_once();
        assert!(wd.coordinates_safe());

        wd.resume_coordinate_check();
        wd.poll_once();
        assert!(!wd.coordinates_safe());

        wd.suspend_coordinate_check(None);
        assert!(!wd.health().coordinates_safe);
    }

    fn sim_watchdog(altitude: f64) -> (Watchdog, Arc<SimClock>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let clock = Arc::new(SimClock::new(start));
        let wd = Watchdog::new(
            WatchdogConfig {
                interval_secs: 0.01,
                liveness_timeout_secs: 0.01,
            },
            SafetyEnvelope::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(FlatSky(altitude)),
        );
        (wd, clock)
    }

    #[test]
    fn test_timed_ignore_lapses() {
        let (wd, clock) = sim_watchdog(45.0);
        wd.register(FakeControl::new(DeviceKind::Camera, ActorHealth::Dead));
        wd.ignore_for(DeviceKind::Camera, Duration::from_secs(10));
        wd.poll_once();
        assert!(wd.is_ignored(DeviceKind::Camera));
        assert!(wd.health().crashed.is_empty());

        clock.advance(Duration::from_secs(10));
        wd.poll_once();
        assert!(!wd.is_ignored(DeviceKind::Camera));
        assert_eq!(wd.health().crashed.as_slice(), &[DeviceKind::Camera]);
    }

    #[test]
    fn test_timed_coordinate_suspension_lapses() {
        let (wd, clock) = sim_watchdog(5.0);
        wd.set_position_source(Arc::new(FixedPosition(Equatorial::new(1.0, 20.0))));
        wd.suspend_coordinate_check(Some(Duration::from_secs(1)));
        wd.poll_once();
        assert!(!wd.coordinate_check_active());
        assert!(wd.coordinates_safe());

        clock.advance(Duration::from_secs(1));
        wd.poll_once();
        assert!(wd.coordinate_check_active());
        assert!(!wd.coordinates_safe());
    }

    #[test]
    fn test_thread_polls_until_stopped() {
        let wd = watchdog(45.0);
        wd.register(FakeControl::new(DeviceKind::Guider, ActorHealth::Dead));
        wd.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        wd.stop();
        assert_eq!(wd.health().crashed.as_slice(), &[DeviceKind::Guider]);
    }
}
