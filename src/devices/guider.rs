use super::{DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub trait GuiderDriver: Hardware {
    /// One guide cycle: measure the guide star and send a correction.
    fn guide_step(&mut self) -> Result<(), DeviceError>;
}

#[derive(Debug)]
struct GuiderEvents {
    loop_done: Signal,
    stop: Signal,
}

#[derive(Clone)]
pub struct Guider {
    actor: DeviceActor<Box<dyn GuiderDriver>>,
    events: Arc<GuiderEvents>,
}

impl Guider {
    pub fn start(drivers: Arc<dyn DriverFactory>) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::Guider, move || drivers.guider())?;
        Ok(Self {
            actor,
            events: Arc::new(GuiderEvents {
                loop_done: Signal::new_set(),
                stop: Signal::new(),
            }),
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn GuiderDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn is_guiding(&self) -> bool {
        !self.events.loop_done.is_set()
    }

    /// Starts the guide loop. A no-op while a loop is already running.
    pub fn start_guiding(&self, step_interval: Duration) -> Result<(), ActorError> {
        if self.is_guiding() {
            return Ok(());
        }
        self.events.stop.clear();
        self.events.loop_done.clear();
        let events = Arc::clone(&self.events);
        let submitted = self.actor.submit(move |guider| {
            info!("Guiding started");
            let mut result = Ok(());
            while !events.stop.is_set() {
                if let Err(e) = guider.guide_step() {
                    warn!(error = %e, "Guide step failed; guiding stopped");
                    result = Err(e);
                    break;
                }
                events.stop.wait(step_interval);
            }
            events.loop_done.set();
            result
        });
        if submitted.is_err() {
            self.events.loop_done.set();
        }
        submitted
    }

    /// Asks the guide loop to end and waits up to `timeout` for it.
    pub fn stop_guiding(&self, timeout: Duration) -> bool {
        self.events.stop.set();
        self.events.loop_done.wait(timeout)
    }
}
