use super::{DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait LampDriver: Hardware {
    fn set_lamp(&mut self, on: bool) -> Result<(), DeviceError>;
}

#[derive(Debug, Default)]
struct LampEvents {
    lamp_done: Signal,
    lamp_on: AtomicBool,
}

#[derive(Clone)]
pub struct FlatLamp {
    actor: DeviceActor<Box<dyn LampDriver>>,
    events: Arc<LampEvents>,
}

impl FlatLamp {
    pub fn start(drivers: Arc<dyn DriverFactory>) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::FlatLamp, move || drivers.lamp())?;
        Ok(Self {
            actor,
            events: Arc::new(LampEvents::default()),
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn LampDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn switch(&self, on: bool) -> Result<(), ActorError> {
        self.events.lamp_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |lamp| {
            let result = lamp.set_lamp(on);
            if result.is_ok() {
                events.lamp_on.store(on, Ordering::SeqCst);
            }
            events.lamp_done.set();
            result
        })
    }

    pub fn wait_lamp(&self, timeout: Duration) -> bool {
        self.events.lamp_done.wait(timeout)
    }

    pub fn is_on(&self) -> bool {
        self.events.lamp_on.load(Ordering::SeqCst)
    }
}
