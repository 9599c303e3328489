use super::{CameraKind, DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use std::sync::Arc;
use std::time::Duration;

pub trait MirrorDriver: Hardware {
    /// Rotates the tertiary mirror to feed the given camera port.
    fn select_port(&mut self, camera: CameraKind) -> Result<(), DeviceError>;
}

#[derive(Clone)]
pub struct TertiaryMirror {
    actor: DeviceActor<Box<dyn MirrorDriver>>,
    port_done: Arc<Signal>,
}

impl TertiaryMirror {
    pub fn start(drivers: Arc<dyn DriverFactory>) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::TertiaryMirror, move || drivers.mirror())?;
        Ok(Self {
            actor,
            port_done: Arc::new(Signal::new_set()),
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn MirrorDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn select_port(&self, camera: CameraKind) -> Result<(), ActorError> {
        self.port_done.clear();
        let done = Arc::clone(&self.port_done);
        self.actor.submit(move |mirror| {
            let result = mirror.select_port(camera);
            done.set();
            result
        })
    }

    pub fn wait_port(&self, timeout: Duration) -> bool {
        self.port_done.wait(timeout)
    }
}
