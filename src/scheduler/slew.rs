use super::{Delivered, RunEnding, RunError, Scheduler};
use crate::astrometry::Equatorial;
use crate::devices::SlewStatus;
use crate::safety::{SafetyEvent, SafetyLevel};
use crate::satellite::{
    follow_check, lead_compensated_time, streak_plan, FollowAction, TrackingMode, FOLLOW_CHECK_SECS,
    SLEW_TIME_SECS,
};
use crate::ticket::Ticket;
use std::time::Duration;
use tracing::{error, info, warn};

/// Coordinate checks resume this long into the park before an unreachable
/// retry.
const REPARK_CHECK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SlewOutcome {
    OnTarget,
    /// The ticket's window ended while waiting for a usable slew.
    WindowPassed,
    /// Pre-flight failed or the target cannot be resolved; the run ends.
    Stopped,
}

impl Scheduler {
    /// Slews to the ticket's target. Failed slews park and retry once
    /// conditions allow; an unreachable target gets one park-and-retry
    /// before a critical shutdown.
    pub(super) fn ticket_slew(&mut self, ticket: &Ticket) -> Result<SlewOutcome, RunError> {
        let Some(mut target) = self.resolve_target(ticket) else {
            error!(ticket = %ticket.name, "Cannot resolve target position; stopping");
            return Ok(SlewOutcome::Stopped);
        };

        let mut status = self.command_slew(target);
        if status == SlewStatus::Failed {
            warn!("Telescope cannot slew to target; waiting until slew conditions are acceptable");
        }
        while status == SlewStatus::Failed {
            self.park_procedure()?;
            if !self.pause(self.config.weather_freq()) {
                self.state.end(RunEnding::ShutdownRequested);
                return Ok(SlewOutcome::Stopped);
            }
            if !self.everything_ok()? {
                return Ok(SlewOutcome::Stopped);
            }
            if ticket.end_utc() <= self.now() {
                info!(ticket = %ticket.name, "Ticket window passed while waiting to slew");
                return Ok(SlewOutcome::WindowPassed);
            }
            match self.resolve_target(ticket) {
                Some(next) => target = next,
                None => return Ok(SlewOutcome::Stopped),
            }
            self.observatory.telescope().unpark().delivered("Unpark");
            status = self.command_slew(target);
        }

        if status == SlewStatus::Unreachable {
            error!(ticket = %ticket.name, "CRITICAL: slew path outside physical limits; one park and retry");
            self.state
                .record(SafetyEvent::SlewUnreachable, SafetyLevel::Error, self.now());
            if self.park_once(Some(REPARK_CHECK_DELAY)) == SlewStatus::Success {
                self.observatory.telescope().unpark().delivered("Unpark");
                warn!(ticket = %ticket.name, "Attempting to slew to the target one more time");
                status = self.command_slew(target);
                if status == SlewStatus::Success {
                    self.watchdog.resume_coordinate_check();
                    return Ok(SlewOutcome::OnTarget);
                }
            }
            return Err(self.critical_shutdown(
                "telescope slew path outside of physical limits; halting until a human can diagnose it",
            ));
        }

        self.watchdog.resume_coordinate_check();
        Ok(SlewOutcome::OnTarget)
    }

    /// Validates the target against the envelope, then slews and waits.
    /// A rejected target is reported as a failed slew without commanding
    /// the mount.
    fn command_slew(&mut self, target: Equatorial) -> SlewStatus {
        if !self.target_allowed(target) {
            self.state.last_slew = Some(SlewStatus::Failed);
            return SlewStatus::Failed;
        }
        info!(ra = target.ra_hours, dec = target.dec_deg, "Slewing to target");
        let telescope = self.observatory.telescope();
        let status = if telescope.slew(target, true).delivered("Slew") {
            telescope.wait_slew(self.config.timeouts.slew()).unwrap_or_else(|| {
                warn!("Slew did not finish in time");
                SlewStatus::Failed
            })
        } else {
            SlewStatus::Failed
        };
        self.state.last_slew = Some(status);
        status
    }

    fn target_allowed(&mut self, target: Equatorial) -> bool {
        let now = self.now();
        match self
            .config
            .envelope
            .check(target, now, self.env.astrometry.as_ref())
        {
            Ok(()) => true,
            Err(violation) => {
                warn!(ra = target.ra_hours, dec = target.dec_deg, %violation, "Target outside the safe envelope");
                self.state
                    .record(SafetyEvent::TargetRejected, SafetyLevel::Warning, now);
                false
            }
        }
    }

    /// Sidereal tickets use their coordinates; satellite tickets look up
    /// the ephemeris and use the current position.
    fn resolve_target(&mut self, ticket: &Ticket) -> Option<Equatorial> {
        if !ticket.satellite_tracking {
            self.state.satellite = None;
            return ticket.target();
        }
        if self.state.satellite.is_none() {
            self.state.satellite = Some(self.env.satellites.lookup(&ticket.name)?);
        }
        let satellite = self.state.satellite.clone()?;
        Some(satellite.position(self.now()))
    }

    /// Parks with one retry. Coordinate checks stay suspended while parked.
    /// A park path outside the mount's limits halts the run.
    pub(super) fn park_procedure(&mut self) -> Result<bool, RunError> {
        let mut status = self.park_once(None);
        if status == SlewStatus::Failed {
            status = self.park_once(None);
        }
        match status {
            SlewStatus::Success => Ok(true),
            SlewStatus::Failed => {
                error!("Telescope failed to park");
                Ok(false)
            }
            SlewStatus::Unreachable => Err(self.critical_shutdown(
                "telescope park path outside of physical limits; halting until a human can diagnose it",
            )),
        }
    }

    /// Parks once with coordinate checks suspended, until resumed when
    /// `check_delay` is `None`.
    fn park_once(&self, check_delay: Option<Duration>) -> SlewStatus {
        self.watchdog.suspend_coordinate_check(check_delay);
        let telescope = self.observatory.telescope();
        let status = if telescope.park().delivered("Park") {
            telescope.wait_park(self.config.timeouts.slew()).unwrap_or(SlewStatus::Failed)
        } else {
            SlewStatus::Failed
        };
        if status != SlewStatus::Success {
            warn!(?status, "Telescope park failed");
        }
        status
    }

    /// Mode 2 slew: aim where the satellite will be once the slew finishes
    /// and match its rates.
    pub(super) fn follow_slew(&mut self) {
        let Some(satellite) = self.state.satellite.clone() else {
            return;
        };
        let now = self.now();
        let rates = satellite.rates(now);
        let target = satellite.position(lead_compensated_time(now, SLEW_TIME_SECS));
        if !self.target_allowed(target) {
            return;
        }
        info!(ra = target.ra_hours, dec = target.dec_deg, "Slewing to satellite for continuous follow");
        let telescope = self.observatory.telescope();
        telescope.slew(target, true).delivered("Slew");
        telescope.set_tracking_rates(rates).delivered("Tracking rates");
        if telescope.wait_slew(self.config.timeouts.slew()).is_none() {
            warn!("Follow slew did not finish in time");
        }
    }

    /// One satellite tracking step. Returns seconds until the next step.
    pub(super) fn tracking_step(&mut self, mode: TrackingMode, fov_arcmin: f64) -> f64 {
        let Some(satellite) = self.state.satellite.clone() else {
            return FOLLOW_CHECK_SECS as f64;
        };
        let now = self.now();
        let rates = satellite.rates(now);

        if mode == TrackingMode::ContinuousFollow {
            let telescope = self.observatory.telescope();
            let (position, telescope_rates) = match (telescope.position(), telescope.tracking_rates()) {
                (Ok(position), Ok(telescope_rates)) => (position, telescope_rates),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Telescope state unavailable for tracking check");
                    return FOLLOW_CHECK_SECS as f64;
                }
            };
            let action = follow_check(position, telescope_rates, satellite.position(now), rates, fov_arcmin);
            match action {
                FollowAction::Reslew => {
                    info!("Telescope pointing drifted off the satellite; re-slewing");
                    self.follow_slew();
                }
                FollowAction::AdjustRates(rates) => {
                    telescope.set_tracking_rates(rates).delivered("Tracking rates");
                }
                FollowAction::Hold => {}
            }
            return action.wait_secs();
        }

        let plan = streak_plan(mode, now, rates, fov_arcmin);
        let target = satellite.position(plan.aim_time);
        if !self.target_allowed(target) {
            return FOLLOW_CHECK_SECS as f64;
        }
        info!(
            mode = u8::from(mode),
            ra = target.ra_hours,
            dec = target.dec_deg,
            "Slewing to capture satellite streak"
        );
        let telescope = self.observatory.telescope();
        telescope.slew(target, true).delivered("Slew");
        if let Some(rates) = plan.rates {
            telescope.set_tracking_rates(rates).delivered("Tracking rates");
        }
        if telescope.wait_slew(self.config.timeouts.slew()).is_none() {
            warn!("Streak slew did not finish in time");
        }
        plan.wait_secs
    }
}
