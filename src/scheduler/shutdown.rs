use super::{Delivered, RunEnding, RunError, Scheduler};
use crate::actor::ActorHealth;
use crate::devices::{DeviceKind, ShutterCommand};
use crate::safety::{SafetyEvent, SafetyLevel};
use std::time::Duration;
use tracing::{error, info, warn};

impl Scheduler {
    /// End-of-run shutdown. Closes up when configured to, or whenever the
    /// weather or an operator demands it, then stops every thread.
    pub(super) fn shutdown(&mut self, calibration: bool) -> Result<(), RunError> {
        let weather = self.env.conditions.weather_alert();
        if self.options.shutdown_toggle || weather || self.state.shutdown.is_requested() {
            info!("Shutting down the observatory");
            self.shutdown_procedure(calibration, true)?;
        } else {
            info!("Shutdown disabled; leaving the observatory as it is");
        }
        self.stop_threads();
        Ok(())
    }

    /// Parks the telescope, closes and parks the dome, then optionally
    /// calibrates and turns the cooler off.
    pub(super) fn shutdown_procedure(&mut self, calibration: bool, cooler_off: bool) -> Result<(), RunError> {
        self.stop_continuous_focus();
        self.stop_guiding();

        let dome = self.observatory.dome().clone();
        dome.slave_to_scope(false).delivered("Dome slaving off");
        // The telescope actor is already down while weather keeps us closed.
        if self.observatory.control(DeviceKind::Telescope).health(Duration::ZERO) != ActorHealth::Stopped {
            info!("Parking telescope");
            self.park_procedure()?;
        }

        info!("Closing the dome");
        dome.park().delivered("Dome park");
        dome.move_shutter(ShutterCommand::Close).delivered("Shutter close");
        if !dome.wait_move(self.config.timeouts.coordination()) {
            warn!("Dome did not finish parking in time");
        }
        if !dome.wait_shutter(self.config.timeouts.shutter()) {
            warn!("Shutter did not finish closing in time");
        }

        if calibration {
            info!("Beginning flat and dark collection");
            self.take_calibration_images(false)?;
        }
        if cooler_off {
            self.observatory.camera().set_cooler(false).delivered("Cooler off");
        }
        Ok(())
    }

    /// Closes the shutter and stops the cooler without moving the mount.
    /// Returns the error that halts the run.
    pub(super) fn critical_shutdown(&mut self, reason: &str) -> RunError {
        error!(reason, "CRITICAL: running critical shutdown");
        let now = self.now();
        self.state
            .record(SafetyEvent::CriticalShutdown, SafetyLevel::Critical, now);
        self.state.critical_shutdowns += 1;
        self.state.end(RunEnding::Aborted);
        self.watchdog.suspend_coordinate_check(None);

        self.stop_continuous_focus();
        self.observatory.guider().stop_guiding(Duration::ZERO);
        let dome = self.observatory.dome();
        dome.slave_to_scope(false).delivered("Dome slaving off");
        dome.move_shutter(ShutterCommand::Close).delivered("Shutter close");
        if !dome.wait_shutter(self.config.timeouts.shutter()) {
            error!("CRITICAL: shutter did not confirm closing");
        }
        self.observatory.camera().set_cooler(false).delivered("Cooler off");

        RunError::CriticalHalt {
            reason: reason.to_string(),
        }
    }

    /// Stops the watchdog and every device actor. Safe to call repeatedly.
    pub(super) fn stop_threads(&mut self) {
        if self.state.threads_stopped {
            return;
        }
        self.state.threads_stopped = true;
        info!("Stopping watchdog and device actors");
        self.watchdog.stop();
        self.observatory.stop_all();
    }
}
