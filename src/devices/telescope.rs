use super::{DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::astrometry::Equatorial;
use crate::signal::{lock, Signal};
use crate::watchdog::PositionSource;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlewStatus {
    Success,
    Failed,
    /// The mount refused the target as physically unreachable.
    Unreachable,
}

/// Offset tracking rates in arcseconds per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingRates {
    pub ra: f64,
    pub dec: f64,
}

impl TrackingRates {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            ra: self.ra * factor,
            dec: self.dec * factor,
        }
    }
}

pub trait TelescopeDriver: Hardware {
    fn slew(&mut self, target: Equatorial, tracking: bool) -> Result<SlewStatus, DeviceError>;
    /// Moves to the park position. A park path the mount cannot take is
    /// reported as `Unreachable`.
    fn park(&mut self) -> Result<SlewStatus, DeviceError>;
    fn unpark(&mut self) -> Result<(), DeviceError>;
    fn set_tracking_rates(&mut self, rates: TrackingRates) -> Result<(), DeviceError>;
    fn position(&mut self) -> Result<Equatorial, DeviceError>;
    fn tracking_rates(&mut self) -> Result<TrackingRates, DeviceError>;
}

#[derive(Debug)]
struct TelescopeEvents {
    slew_done: Signal,
    last_status: Mutex<SlewStatus>,
    park_done: Signal,
    park_status: Mutex<SlewStatus>,
}

impl Default for TelescopeEvents {
    fn default() -> Self {
        Self {
            slew_done: Signal::new_set(),
            last_status: Mutex::new(SlewStatus::Success),
            park_done: Signal::new_set(),
            park_status: Mutex::new(SlewStatus::Success),
        }
    }
}

#[derive(Clone)]
pub struct Telescope {
    actor: DeviceActor<Box<dyn TelescopeDriver>>,
    events: Arc<TelescopeEvents>,
    request_timeout: Duration,
}

impl Telescope {
    pub fn start(drivers: Arc<dyn DriverFactory>, request_timeout: Duration) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::Telescope, move || drivers.telescope())?;
        Ok(Self {
            actor,
            events: Arc::new(TelescopeEvents::default()),
            request_timeout,
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn TelescopeDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn slew(&self, target: Equatorial, tracking: bool) -> Result<(), ActorError> {
        self.events.slew_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |telescope| {
            let status = telescope.slew(target, tracking).unwrap_or(SlewStatus::Failed);
            *lock(&events.last_status) = status;
            events.slew_done.set();
            Ok(())
        })
    }

    /// Waits for the pending slew. `None` means it did not finish in time.
    pub fn wait_slew(&self, timeout: Duration) -> Option<SlewStatus> {
        if self.events.slew_done.wait(timeout) {
            Some(*lock(&self.events.last_status))
        } else {
            None
        }
    }

    pub fn park(&self) -> Result<(), ActorError> {
        self.events.park_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |telescope| {
            let result = telescope.park();
            *lock(&events.park_status) = match &result {
                Ok(status) => *status,
                Err(_) => SlewStatus::Failed,
            };
            events.park_done.set();
            result.map(|_| ())
        })
    }

    /// Waits for the pending park. `None` means it did not finish in time.
    pub fn wait_park(&self, timeout: Duration) -> Option<SlewStatus> {
        if self.events.park_done.wait(timeout) {
            Some(*lock(&self.events.park_status))
        } else {
            None
        }
    }

    pub fn unpark(&self) -> Result<(), ActorError> {
        self.actor.submit(|telescope| telescope.unpark())
    }

    pub fn set_tracking_rates(&self, rates: TrackingRates) -> Result<(), ActorError> {
        self.actor.submit(move |telescope| telescope.set_tracking_rates(rates))
    }

    pub fn clear_tracking_rates(&self) -> Result<(), ActorError> {
        self.set_tracking_rates(TrackingRates::default())
    }

    pub fn position(&self) -> Result<Equatorial, ActorError> {
        self.actor.request(|telescope| telescope.position(), self.request_timeout)
    }

    pub fn tracking_rates(&self) -> Result<TrackingRates, ActorError> {
        self.actor
            .request(|telescope| telescope.tracking_rates(), self.request_timeout)
    }
}

impl PositionSource for Telescope {
    fn is_connected(&self) -> bool {
        self.actor.state() == crate::actor::ConnectionState::Connected
    }

    fn sample(&self, timeout: Duration) -> Option<Equatorial> {
        self.actor
            .request(|telescope| telescope.position(), timeout)
            .ok()
    }
}
