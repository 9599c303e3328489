use super::{DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shutter status as reported by the dome controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    Open = 0,
    Closed = 1,
    Opening = 2,
    Closing = 3,
    Faulted = 4,
}

impl TryFrom<u8> for ShutterState {
    type Error = DeviceError;

    fn try_from(code: u8) -> Result<Self, DeviceError> {
        match code {
            0 => Ok(ShutterState::Open),
            1 => Ok(ShutterState::Closed),
            2 => Ok(ShutterState::Opening),
            3 => Ok(ShutterState::Closing),
            4 => Ok(ShutterState::Faulted),
            other => Err(DeviceError::CommandFailed(format!("unknown shutter code {other}"))),
        }
    }
}

impl ShutterState {
    /// Closed, closing or faulted shutters are (re)opened at startup.
    pub fn needs_opening(self) -> bool {
        matches!(self, ShutterState::Closed | ShutterState::Closing | ShutterState::Faulted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterCommand {
    Open,
    Close,
}

pub trait DomeDriver: Hardware {
    fn shutter_status(&mut self) -> Result<ShutterState, DeviceError>;
    fn move_shutter(&mut self, command: ShutterCommand) -> Result<(), DeviceError>;
    fn home(&mut self) -> Result<(), DeviceError>;
    fn park(&mut self) -> Result<(), DeviceError>;
    fn slave_to_scope(&mut self, slaved: bool) -> Result<(), DeviceError>;
}

#[derive(Debug)]
struct DomeEvents {
    shutter_done: Signal,
    shutter_ok: AtomicBool,
    move_done: Signal,
    has_homed: Signal,
}

impl Default for DomeEvents {
    fn default() -> Self {
        Self {
            shutter_done: Signal::new_set(),
            shutter_ok: AtomicBool::new(true),
            move_done: Signal::new_set(),
            has_homed: Signal::new(),
        }
    }
}

#[derive(Clone)]
pub struct Dome {
    actor: DeviceActor<Box<dyn DomeDriver>>,
    events: Arc<DomeEvents>,
    request_timeout: Duration,
}

impl Dome {
    pub fn start(drivers: Arc<dyn DriverFactory>, request_timeout: Duration) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::Dome, move || drivers.dome())?;
        Ok(Self {
            actor,
            events: Arc::new(DomeEvents::default()),
            request_timeout,
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn DomeDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn shutter_status(&self) -> Result<ShutterState, ActorError> {
        self.actor.request(|dome| dome.shutter_status(), self.request_timeout)
    }

    pub fn move_shutter(&self, command: ShutterCommand) -> Result<(), ActorError> {
        self.events.shutter_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |dome| {
            let result = dome.move_shutter(command);
            events.shutter_ok.store(result.is_ok(), Ordering::SeqCst);
            events.shutter_done.set();
            result
        })
    }

    /// True if the last shutter move finished successfully within `timeout`.
    pub fn wait_shutter(&self, timeout: Duration) -> bool {
        self.events.shutter_done.wait(timeout) && self.events.shutter_ok.load(Ordering::SeqCst)
    }

    pub fn home(&self) -> Result<(), ActorError> {
        self.events.move_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |dome| {
            let result = dome.home();
            if result.is_ok() {
                events.has_homed.set();
            }
            events.move_done.set();
            result
        })
    }

    pub fn park(&self) -> Result<(), ActorError> {
        self.events.move_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |dome| {
            let result = dome.park();
            events.move_done.set();
            result
        })
    }

    pub fn wait_move(&self, timeout: Duration) -> bool {
        self.events.move_done.wait(timeout)
    }

    pub fn has_homed(&self) -> bool {
        self.events.has_homed.is_set()
    }

    pub fn slave_to_scope(&self, slaved: bool) -> Result<(), ActorError> {
        self.actor.submit(move |dome| dome.slave_to_scope(slaved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutter_codes() {
        assert_eq!(ShutterState::try_from(0u8), Ok(ShutterState::Open));
        assert_eq!(ShutterState::try_from(3u8), Ok(ShutterState::Closing));
        assert!(ShutterState::try_from(9u8).is_err());
        assert!(ShutterState::Faulted.needs_opening());
        assert!(!ShutterState::Opening.needs_opening());
    }
}
