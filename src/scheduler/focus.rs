use super::{Delivered, RunError, Scheduler};
use crate::clock::seconds;
use crate::devices::FocusRequest;
use crate::safety::{SafetyEvent, SafetyLevel};
use crate::ticket::Ticket;
use std::time::{Duration, Instant};
use tracing::{info, warn};

impl Scheduler {
    /// Focus request for a ticket: its first filter, at a fraction of its
    /// first exposure time.
    fn focus_request(&self, ticket: &Ticket) -> Option<FocusRequest> {
        let filter = ticket.filters.first()?;
        let exp = *ticket.exp_times.first()?;
        Some(FocusRequest {
            exposure_secs: self.config.focus_exposure(exp),
            filter_position: self.config.filter_position(filter)?,
            camera: self.observatory.camera().kind(),
        })
    }

    /// Runs the initial focus for a ticket that asks for it. A failed or
    /// timed-out run disables focusing for the rest of the night.
    pub(super) fn focus_target(&mut self, ticket: &Ticket) -> Result<(), RunError> {
        self.stop_continuous_focus();
        let Some(request) = self.focus_request(ticket) else {
            return Ok(());
        };
        self.state.focus_request = Some(request);
        if !ticket.initial_focus {
            return Ok(());
        }

        let focuser = self.observatory.focuser().clone();
        if !focuser.initial_focus(request).delivered("Initial focus") {
            self.disable_focus();
            return Ok(());
        }

        let step = self.config.poll_interval().min(Duration::from_secs(1));
        let deadline = Instant::now() + self.config.timeouts.focus();
        loop {
            if focuser.wait_focus(step) {
                info!(ticket = %ticket.name, "Focus complete");
                self.state.focused = true;
                return Ok(());
            }
            if focuser.focus_finished() {
                warn!(ticket = %ticket.name, "Focus run failed");
                self.disable_focus();
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(ticket = %ticket.name, "Focus did not finish in time");
                self.disable_focus();
                return Ok(());
            }
            if !self.everything_ok()? {
                return Ok(());
            }
        }
    }

    /// Stops all focusing for the rest of the run.
    pub(super) fn disable_focus(&mut self) {
        if !self.state.focus_enabled && !self.state.continuous_focus {
            return;
        }
        warn!("Focusing disabled for the rest of the run");
        self.state.focus_enabled = false;
        self.state.continuous_focus = false;
        self.observatory.focuser().stop_continuous();
        let now = self.now();
        self.state.record(SafetyEvent::FocusDisabled, SafetyLevel::Warning, now);
    }

    pub(super) fn start_continuous_focus(&mut self, ticket: &Ticket) {
        if !(self.state.focus_enabled && self.state.continuous_focus) {
            return;
        }
        let Some(request) = self.state.focus_request.or_else(|| self.focus_request(ticket)) else {
            return;
        };
        self.state.focus_request = Some(request);
        let interval = seconds(self.config.continuous_focus_interval_secs);
        info!(ticket = %ticket.name, "Starting continuous focus");
        self.observatory
            .focuser()
            .continuous_focus(request, interval)
            .delivered("Continuous focus");
    }

    pub(super) fn stop_continuous_focus(&self) {
        self.observatory.focuser().stop_continuous();
    }

    pub(super) fn start_guiding(&mut self) {
        let step = seconds(self.config.guide_step_secs);
        self.state.guiding = self
            .observatory
            .guider()
            .start_guiding(step)
            .delivered("Guiding");
    }

    pub(super) fn stop_guiding(&mut self) {
        if !self.state.guiding && !self.observatory.guider().is_guiding() {
            return;
        }
        if !self.observatory.guider().stop_guiding(self.config.timeouts.guider_stop()) {
            warn!("Guider did not stop in time");
        }
        self.state.guiding = false;
    }
}
