//! The observation scheduler.
//!
//! Works through a night's tickets on the calling thread: startup, slew,
//! focus, expose and shutdown, with weather suspension, calibration and
//! crash recovery folded in. Device commands go through the actors; the
//! scheduler blocks on their completion signals with bounded waits.

mod calibration;
mod exposure;
mod focus;
mod preflight;
pub mod restart;
mod shutdown;
mod slew;
mod state;

pub use preflight::StartupOutcome;
pub use restart::{obligations, Obligation, RESTART_TABLE};
pub use state::{RunEnding, RunReport, RunState, TicketReport};

use crate::actor::ActorError;
use crate::astrometry::Astrometry;
use crate::clock::{until, Clock};
use crate::conditions::Conditions;
use crate::config::{CalibrationTime, ObservatoryConfig};
use crate::devices::{DeviceKind, DriverFactory, ProcessMonitor};
use crate::observatory::Observatory;
use crate::satellite::SatelliteCatalog;
use crate::signal::ShutdownHandle;
use crate::ticket::{Ticket, TicketError};
use crate::watchdog::Watchdog;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("CRITICAL: {reason}")]
    CriticalHalt { reason: String },
    #[error("no tickets to observe")]
    EmptyPlan,
    #[error(transparent)]
    InvalidTicket(#[from] TicketError),
    #[error(transparent)]
    Actor(#[from] ActorError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator switches for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub image_dir: PathBuf,
    /// Close up at the end of the plan.
    pub shutdown_toggle: bool,
    pub calibration_toggle: bool,
    pub focus_toggle: bool,
}

impl RunOptions {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            shutdown_toggle: true,
            calibration_toggle: false,
            focus_toggle: true,
        }
    }
}

/// The collaborators the scheduler talks to besides the device actors.
#[derive(Clone)]
pub struct Environment {
    pub drivers: Arc<dyn DriverFactory>,
    pub clock: Arc<dyn Clock>,
    pub conditions: Arc<dyn Conditions>,
    pub astrometry: Arc<dyn Astrometry>,
    pub satellites: Arc<dyn SatelliteCatalog>,
    pub processes: Arc<dyn ProcessMonitor>,
}

/// Outcome of waiting for a ticket's start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartWait {
    Ready,
    /// The observatory was closed for the gap; `cooler` says whether startup
    /// must turn the camera cooler back on.
    ShutDown { cooler: bool },
    Cancelled,
}

pub(crate) trait Delivered {
    /// Logs an undeliverable command and reports whether it was queued.
    fn delivered(self, what: &str) -> bool;
}

impl Delivered for Result<(), ActorError> {
    fn delivered(self, what: &str) -> bool {
        match self {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "{what} not delivered");
                false
            }
        }
    }
}

pub struct Scheduler {
    tickets: Vec<Ticket>,
    config: ObservatoryConfig,
    options: RunOptions,
    env: Environment,
    observatory: Observatory,
    watchdog: Arc<Watchdog>,
    state: RunState,
}

impl Scheduler {
    /// Validates the plan, starts every device actor and the watchdog.
    pub fn new(
        tickets: Vec<Ticket>,
        config: ObservatoryConfig,
        options: RunOptions,
        env: Environment,
    ) -> Result<Self, RunError> {
        let first_camera = tickets.first().ok_or(RunError::EmptyPlan)?.camera;
        for ticket in &tickets {
            ticket.validate()?;
            if let Some(filter) = ticket.filters.iter().find(|f| config.filter_position(f).is_none()) {
                return Err(TicketError::Invalid {
                    name: ticket.name.clone(),
                    reason: format!("filter {filter:?} is not on the filter wheel"),
                }
                .into());
            }
        }

        let watchdog = Arc::new(Watchdog::new(
            config.watchdog,
            config.envelope,
            Arc::clone(&env.clock),
            Arc::clone(&env.astrometry),
        ));
        let observatory = Observatory::start(
            Arc::clone(&env.drivers),
            first_camera.unwrap_or(config.default_camera),
            config.timeouts,
            Arc::clone(&watchdog),
        )?;
        watchdog.start()?;

        let state = RunState::new(tickets.len(), options.focus_toggle, ShutdownHandle::new());
        info!(tickets = tickets.len(), "Scheduler ready");
        Ok(Self {
            tickets,
            config,
            options,
            env,
            observatory,
            watchdog,
            state,
        })
    }

    /// Handle that asks the run to close up and end at the next check.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.state.shutdown.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn observatory(&self) -> &Observatory {
        &self.observatory
    }

    pub fn report(&self) -> RunReport {
        self.state.report()
    }

    /// Runs the whole plan. Device actors and the watchdog are stopped on
    /// return, whatever the outcome.
    pub fn observe(&mut self) -> Result<RunReport, RunError> {
        let result = self.run();
        self.stop_threads();
        match result {
            Ok(()) => {
                self.state.end(RunEnding::Completed);
                let report = self.report();
                info!(ending = ?report.ending, restarts = report.restarts.total(), "Run finished");
                Ok(report)
            }
            Err(e) => {
                self.state.end(RunEnding::Aborted);
                error!(error = %e, "Run halted");
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<(), RunError> {
        let mut cooler = true;
        if self.calibrate_at(CalibrationTime::Start) {
            cooler = false;
            self.settle_cooler();
            info!("Beginning flat and dark collection");
            self.take_calibration_images(true)?;
        }

        if self.check_start_time(0)? == StartWait::Cancelled {
            return self.close_early();
        }
        let mut initial_shutter = match self.startup(cooler)? {
            StartupOutcome::Ready { initial_shutter } => initial_shutter,
            StartupOutcome::Aborted => {
                self.state.end(RunEnding::Aborted);
                return Ok(());
            }
        };

        for index in 0..self.tickets.len() {
            self.state.current_ticket = Some(index);
            let ticket = self.tickets[index].clone();

            if !self.everything_ok()? {
                return self.close_early();
            }
            self.crash_check(DeviceKind::Telescope)?;
            self.crash_check(DeviceKind::Dome)?;
            self.select_camera(&ticket)?;

            let wait = self.check_start_time(index)?;
            if wait == StartWait::Cancelled {
                return self.close_early();
            }
            if ticket.end_utc() < self.now() {
                info!(ticket = %ticket.name, end = %ticket.end_time, "End time already passed; skipping");
                self.push_report(&ticket, 0);
                continue;
            }
            if !self.everything_ok()? {
                return self.close_early();
            }
            if let StartWait::ShutDown { cooler } = wait {
                match self.startup(cooler)? {
                    StartupOutcome::Ready { initial_shutter: shutter } => initial_shutter = shutter,
                    StartupOutcome::Aborted => {
                        self.state.end(RunEnding::Aborted);
                        return Ok(());
                    }
                }
            }

            match self.ticket_slew(&ticket)? {
                slew::SlewOutcome::OnTarget => {}
                slew::SlewOutcome::WindowPassed => {
                    self.push_report(&ticket, 0);
                    continue;
                }
                slew::SlewOutcome::Stopped => return self.close_early(),
            }
            if initial_shutter.needs_opening() {
                self.wait_dome_open();
            }
            if !self.observatory.camera().wait_cooler(self.config.timeouts.cooler()) {
                warn!("Cooler did not settle in time; continuing");
            }
            if self.state.focus_enabled && !(ticket.satellite_tracking && self.state.focused) {
                info!(ticket = %ticket.name, "Focusing on target");
                self.focus_target(&ticket)?;
            }
            if !self.everything_ok()? {
                return self.close_early();
            }

            let (taken, total) = self.run_ticket(&ticket)?;
            info!(ticket = %ticket.name, taken, total, "Exposures taken; moving on to next target");
            self.state.tickets.push(TicketReport {
                name: ticket.name.clone(),
                taken,
                total,
            });
            if self.state.ending.is_some() {
                return self.close_early();
            }
        }

        self.shutdown(self.calibrate_at(CalibrationTime::End))
    }

    /// Waits for the ticket's start. Between tickets, long gaps close the
    /// observatory in the meantime.
    fn check_start_time(&mut self, index: usize) -> Result<StartWait, RunError> {
        let start = self.tickets[index].start_utc();
        let now = self.now();
        if start <= now {
            return Ok(StartWait::Ready);
        }
        info!(
            ticket = %self.tickets[index].name,
            start = %self.tickets[index].start_time,
            "Waiting for ticket start time"
        );

        let gap = start - now;
        let long_gap = minutes(self.config.long_gap_hours * 60.0);
        let short_gap = minutes(self.config.short_gap_minutes);
        let mut outcome = StartWait::Ready;
        if index != 0 && gap > long_gap {
            info!("Next ticket starts much later; shutting down in the meantime");
            self.shutdown_procedure(self.calibrate_at(CalibrationTime::End), true)?;
            self.stop_continuous_focus();
            self.stop_guiding();
            outcome = StartWait::ShutDown { cooler: true };
        } else if index != 0 && gap > short_gap {
            info!("Next ticket is not immediate; closing in the meantime");
            self.shutdown_procedure(false, false)?;
            self.stop_continuous_focus();
            self.stop_guiding();
            outcome = StartWait::ShutDown { cooler: false };
        }

        if !self.pause_until(start) {
            return Ok(StartWait::Cancelled);
        }
        Ok(outcome)
    }

    fn close_early(&mut self) -> Result<(), RunError> {
        if self.state.shutdown.is_requested() {
            self.state.end(RunEnding::ShutdownRequested);
        }
        self.state.end(RunEnding::Aborted);
        self.shutdown(false)
    }

    fn push_report(&mut self, ticket: &Ticket, taken: u32) {
        self.state.tickets.push(TicketReport {
            name: ticket.name.clone(),
            taken,
            total: ticket.total_exposures(),
        });
    }

    fn calibrate_at(&self, when: CalibrationTime) -> bool {
        self.options.calibration_toggle && self.config.calibration_time == when
    }

    fn ticket_dir(&self, ticket: &Ticket) -> PathBuf {
        self.options.image_dir.join(&ticket.name)
    }

    fn last_end(&self) -> DateTime<Utc> {
        self.tickets
            .iter()
            .map(Ticket::end_utc)
            .max()
            .unwrap_or_else(|| self.now())
    }

    fn now(&self) -> DateTime<Utc> {
        self.env.clock.now()
    }

    /// Sleeps on the run clock in polling steps. Returns false as soon as a
    /// shutdown is requested.
    fn pause(&self, duration: Duration) -> bool {
        let step = self.config.poll_interval();
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.state.shutdown.is_requested() {
                return false;
            }
            let chunk = remaining.min(step);
            self.env.clock.sleep(chunk);
            remaining -= chunk;
        }
        !self.state.shutdown.is_requested()
    }

    fn pause_until(&self, deadline: DateTime<Utc>) -> bool {
        self.pause(until(self.now(), deadline))
    }
}

fn minutes(value: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((value * 60_000.0).round() as i64)
}
