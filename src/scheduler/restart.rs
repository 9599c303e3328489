//! Crash recovery.
//!
//! Every device kind maps to the obligations a fresh actor must have
//! re-established before the run can rely on it again.

use super::{Delivered, RunError, Scheduler};
use crate::actor::{ActorHealth, ConnectionState};
use crate::clock::seconds;
use crate::devices::{CameraKind, DeviceKind};
use crate::safety::{SafetyEvent, SafetyLevel};
use static_assertions::const_assert_eq;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Obligation {
    /// Wait for the replacement to report liveness.
    AwaitLiveness,
    /// Turn the cooler back on if it was on before the crash.
    RestoreCooler,
    ResumeGuiding,
    ResumeContinuousFocus,
    /// Point the mirror back at the active camera.
    ReselectMirrorPort,
}

pub const RESTART_TABLE: [(DeviceKind, &[Obligation]); 7] = [
    (
        DeviceKind::Camera,
        &[Obligation::AwaitLiveness, Obligation::RestoreCooler],
    ),
    (DeviceKind::Telescope, &[Obligation::AwaitLiveness]),
    (DeviceKind::Dome, &[Obligation::AwaitLiveness]),
    (
        DeviceKind::Focuser,
        &[Obligation::AwaitLiveness, Obligation::ResumeContinuousFocus],
    ),
    (
        DeviceKind::Guider,
        &[Obligation::AwaitLiveness, Obligation::ResumeGuiding],
    ),
    (
        DeviceKind::TertiaryMirror,
        &[Obligation::AwaitLiveness, Obligation::ReselectMirrorPort],
    ),
    (DeviceKind::FlatLamp, &[Obligation::AwaitLiveness]),
];

const_assert_eq!(RESTART_TABLE.len(), DeviceKind::ALL.len());

pub fn obligations(kind: DeviceKind) -> &'static [Obligation] {
    RESTART_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, obligations)| *obligations)
        .unwrap_or(&[])
}

/// What was running before a restart, so obligations can put it back.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    cooler_on: bool,
    guiding: bool,
    continuous_focus: bool,
}

impl Scheduler {
    /// Replaces the actor for `kind`, counts the restart and restores what
    /// the old instance was doing.
    pub(super) fn restart(&mut self, kind: DeviceKind) -> Result<(), RunError> {
        let snapshot = Snapshot {
            cooler_on: self.observatory.camera().cooler_on(),
            guiding: self.state.guiding,
            continuous_focus: self.state.continuous_focus && self.observatory.focuser().is_continuous_running(),
        };

        self.observatory.replace(kind)?;
        let now = self.now();
        let count = self.state.restarts.increment(kind, now);
        self.state
            .record(SafetyEvent::DeviceRestarted(kind), SafetyLevel::Warning, now);
        info!(%kind, count, "Device restarted");

        for obligation in obligations(kind) {
            self.fulfil(kind, *obligation, snapshot);
        }
        Ok(())
    }

    fn fulfil(&mut self, kind: DeviceKind, obligation: Obligation, snapshot: Snapshot) {
        match obligation {
            Obligation::AwaitLiveness => {
                if !self.observatory.control(kind).is_alive(self.config.timeouts.liveness()) {
                    warn!(%kind, "Restarted device has not connected yet");
                }
            }
            Obligation::RestoreCooler => {
                if snapshot.cooler_on {
                    self.observatory.camera().cooler_settle().delivered("Cooler settle");
                }
            }
            Obligation::ResumeGuiding => {
                if snapshot.guiding {
                    self.state.guiding = false;
                    self.start_guiding();
                }
            }
            Obligation::ResumeContinuousFocus => {
                if let (true, Some(request)) = (snapshot.continuous_focus, self.state.focus_request) {
                    let interval = seconds(self.config.continuous_focus_interval_secs);
                    self.observatory
                        .focuser()
                        .continuous_focus(request, interval)
                        .delivered("Continuous focus");
                }
            }
            Obligation::ReselectMirrorPort => {
                let mirror = self.observatory.mirror();
                let camera = self.observatory.camera().kind();
                if mirror.select_port(camera).delivered("Mirror port")
                    && !mirror.wait_port(self.config.timeouts.coordination())
                {
                    warn!(%camera, "Mirror did not reach the camera port in time");
                }
            }
        }
    }

    /// Restarts a device whose vendor automation process stopped responding.
    /// Returns true if a restart happened.
    pub(super) fn crash_check(&mut self, kind: DeviceKind) -> Result<bool, RunError> {
        // Only the CCD camera runs behind a separate automation process.
        if kind == DeviceKind::Camera && self.observatory.camera().kind() != CameraKind::Ccd {
            return Ok(false);
        }
        let Some(program) = self.config.vendor_processes.program(kind).map(str::to_owned) else {
            return Ok(false);
        };
        if self.env.processes.is_responding(&program) {
            return Ok(false);
        }

        error!(%kind, program = %program, "Vendor process not responding; restarting");
        // The ignore lapses on its own if the restart stalls.
        let budget = self.config.settle() * 2 + self.config.timeouts.coordination();
        self.watchdog.ignore_for(kind, budget);
        self.observatory.control(kind).mark_crashed();
        let now = self.now();
        self.state
            .record(SafetyEvent::DeviceCrashed(kind), SafetyLevel::Error, now);

        self.env.clock.sleep(self.config.settle());
        self.env.processes.terminate(&program);
        self.env.clock.sleep(self.config.settle());
        let restarted = self.restart(kind);
        self.watchdog.resume(kind);
        restarted?;
        Ok(true)
    }

    /// Replaces `kind` if its actor is in the `Crashed` state. An actor the
    /// watchdog did not report is left alone while it is ignored.
    pub(super) fn recover_crashed(&mut self, kind: DeviceKind, reported: bool) -> Result<bool, RunError> {
        // A crash check may already have replaced it.
        if self.observatory.control(kind).state() != ConnectionState::Crashed {
            return Ok(false);
        }
        if !reported && self.watchdog.is_ignored(kind) {
            return Ok(false);
        }
        if reported {
            error!(%kind, "Watchdog reported a dead actor; restarting");
        } else {
            error!(%kind, "Actor crashed; restarting");
        }
        let now = self.now();
        self.state
            .record(SafetyEvent::DeviceCrashed(kind), SafetyLevel::Error, now);
        self.restart(kind)?;
        Ok(true)
    }

    /// Restarts every crashed actor, whether or not the watchdog has polled
    /// it yet, and every actor that stopped while still expected to run.
    /// Unsafe telescope coordinates end the run.
    pub(super) fn thread_check(&mut self) -> Result<(), RunError> {
        let reported = self.watchdog.take_crashed();
        for kind in DeviceKind::ALL {
            self.recover_crashed(kind, reported.contains(&kind))?;
        }

        for kind in DeviceKind::ALL {
            if self.watchdog.is_ignored(kind) {
                continue;
            }
            if self.observatory.control(kind).health(Duration::ZERO) == ActorHealth::Stopped {
                warn!(%kind, "Actor stopped unexpectedly; restarting");
                self.restart(kind)?;
            }
        }

        if !self.watchdog.coordinates_safe() {
            let now = self.now();
            self.state
                .record(SafetyEvent::CoordinatesUnsafe, SafetyLevel::Critical, now);
            return Err(self.critical_shutdown("telescope coordinates outside the safe envelope"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_device_has_obligations() {
        for kind in DeviceKind::ALL {
            assert_eq!(obligations(kind).first(), Some(&Obligation::AwaitLiveness));
        }
    }

    #[test]
    fn test_obligations_per_device() {
        assert!(obligations(DeviceKind::Camera).contains(&Obligation::RestoreCooler));
        assert!(obligations(DeviceKind::Guider).contains(&Obligation::ResumeGuiding));
        assert!(obligations(DeviceKind::Focuser).contains(&Obligation::ResumeContinuousFocus));
        assert!(obligations(DeviceKind::TertiaryMirror).contains(&Obligation::ReselectMirrorPort));
        assert_eq!(obligations(DeviceKind::Dome), &[Obligation::AwaitLiveness]);
    }
}
