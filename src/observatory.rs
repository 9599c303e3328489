//! The set of device actors that make up the observatory.

use crate::actor::{ActorError, DeviceControl};
use crate::config::Timeouts;
use crate::devices::{
    Camera, CameraKind, DeviceKind, Dome, DriverFactory, FlatLamp, Focuser, Guider, Telescope,
    TertiaryMirror,
};
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a replaced actor gets to drain before its successor starts.
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Observatory {
    drivers: Arc<dyn DriverFactory>,
    watchdog: Arc<Watchdog>,
    timeouts: Timeouts,
    camera: Camera,
    telescope: Telescope,
    dome: Dome,
    focuser: Focuser,
    guider: Guider,
    mirror: TertiaryMirror,
    lamp: FlatLamp,
}

impl Observatory {
    /// Starts one actor per device and registers each with the watchdog.
    pub fn start(
        drivers: Arc<dyn DriverFactory>,
        camera_kind: CameraKind,
        timeouts: Timeouts,
        watchdog: Arc<Watchdog>,
    ) -> Result<Self, ActorError> {
        let request = timeouts.request();
        let observatory = Self {
            camera: Camera::start(camera_kind, Arc::clone(&drivers))?,
            telescope: Telescope::start(Arc::clone(&drivers), request)?,
            dome: Dome::start(Arc::clone(&drivers), request)?,
            focuser: Focuser::start(Arc::clone(&drivers))?,
            guider: Guider::start(Arc::clone(&drivers))?,
            mirror: TertiaryMirror::start(Arc::clone(&drivers))?,
            lamp: FlatLamp::start(Arc::clone(&drivers))?,
            drivers,
            watchdog,
            timeouts,
        };

        for kind in DeviceKind::ALL {
            observatory.watchdog.register(observatory.control(kind));
        }
        observatory
            .watchdog
            .set_position_source(Arc::new(observatory.telescope.clone()));
        info!(camera = %camera_kind, "Observatory actors started");
        Ok(observatory)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn telescope(&self) -> &Telescope {
        &self.telescope
    }

    pub fn dome(&self) -> &Dome {
        &self.dome
    }

    pub fn focuser(&self) -> &Focuser {
        &self.focuser
    }

    pub fn guider(&self) -> &Guider {
        &self.guider
    }

    pub fn mirror(&self) -> &TertiaryMirror {
        &self.mirror
    }

    pub fn lamp(&self) -> &FlatLamp {
        &self.lamp
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn control(&self, kind: DeviceKind) -> Arc<dyn DeviceControl> {
        match kind {
            DeviceKind::Camera => self.camera.control(),
            DeviceKind::Telescope => self.telescope.control(),
            DeviceKind::Dome => self.dome.control(),
            DeviceKind::Focuser => self.focuser.control(),
            DeviceKind::Guider => self.guider.control(),
            DeviceKind::TertiaryMirror => self.mirror.control(),
            DeviceKind::FlatLamp => self.lamp.control(),
        }
    }

    /// Stops the actor for `kind` and starts a fresh instance in its place.
    /// Obligations such as cooler state are the caller's to restore.
    pub fn replace(&mut self, kind: DeviceKind) -> Result<(), ActorError> {
        self.retire(kind);
        let request = self.timeouts.request();
        let drivers = Arc::clone(&self.drivers);
        match kind {
            DeviceKind::Camera => self.camera = Camera::start(self.camera.kind(), drivers)?,
            DeviceKind::Telescope => {
                self.telescope = Telescope::start(drivers, request)?;
                self.watchdog
                    .set_position_source(Arc::new(self.telescope.clone()));
            }
            DeviceKind::Dome => self.dome = Dome::start(drivers, request)?,
            DeviceKind::Focuser => self.focuser = Focuser::start(drivers)?,
            DeviceKind::Guider => self.guider = Guider::start(drivers)?,
            DeviceKind::TertiaryMirror => self.mirror = TertiaryMirror::start(drivers)?,
            DeviceKind::FlatLamp => self.lamp = FlatLamp::start(drivers)?,
        }
        self.watchdog.register(self.control(kind));
        info!(%kind, "Actor replaced");
        Ok(())
    }

    /// Replaces the camera actor with one for a different camera kind.
    pub fn swap_camera(&mut self, kind: CameraKind) -> Result<(), ActorError> {
        if self.camera.kind() == kind {
            return Ok(());
        }
        info!(from = %self.camera.kind(), to = %kind, "Swapping camera");
        self.retire(DeviceKind::Camera);
        self.camera = Camera::start(kind, Arc::clone(&self.drivers))?;
        self.watchdog.register(self.camera.control());
        Ok(())
    }

    /// Stops every actor and waits briefly for each thread to end.
    pub fn stop_all(&self) {
        for kind in DeviceKind::ALL {
            self.watchdog.unregister(kind);
        }
        self.focuser.stop_continuous();
        self.guider.stop_guiding(Duration::ZERO);
        let controls: Vec<_> = DeviceKind::ALL.iter().map(|kind| self.control(*kind)).collect();
        for control in &controls {
            control.stop();
        }
        for control in &controls {
            if !control.wait_terminated(RETIRE_TIMEOUT) {
                warn!(kind = %control.kind(), "Actor did not stop in time");
            }
        }
    }

    fn retire(&self, kind: DeviceKind) {
        // Long-running loops only end on their own stop signals.
        match kind {
            DeviceKind::Focuser => self.focuser.stop_continuous(),
            DeviceKind::Guider => {
                self.guider.stop_guiding(Duration::ZERO);
            }
            _ => {}
        }
        let old = self.control(kind);
        old.stop();
        if !old.wait_terminated(RETIRE_TIMEOUT) {
            warn!(%kind, "Previous actor still running; abandoning it");
        }
    }
}
