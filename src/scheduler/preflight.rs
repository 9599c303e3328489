use super::slew::SlewOutcome;
use super::{minutes, Delivered, RunEnding, RunError, Scheduler};
use crate::clock::seconds;
use crate::config::CalibrationTime;
use crate::devices::{DeviceKind, ShutterCommand, ShutterState};
use crate::safety::{SafetyEvent, SafetyLevel};
use std::time::Duration;
use tracing::{error, info, warn};

/// Devices whose liveness gates observing.
const BLOCKING_DEVICES: [DeviceKind; 5] = [
    DeviceKind::Camera,
    DeviceKind::Telescope,
    DeviceKind::Dome,
    DeviceKind::FlatLamp,
    DeviceKind::TertiaryMirror,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready { initial_shutter: ShutterState },
    /// Pre-flight failed without a weather alert; the run ends.
    Aborted,
}

impl Scheduler {
    /// Hardware, watchdog and weather checks before any observing step.
    /// Suspends for weather in place and returns once the observatory has
    /// reopened, or false if the run cannot continue.
    pub(super) fn everything_ok(&mut self) -> Result<bool, RunError> {
        if self.state.shutdown.is_requested() {
            self.state.end(RunEnding::ShutdownRequested);
            return Ok(false);
        }

        // Crashed actors are replaced first so the sweep sees their successors.
        self.thread_check()?;

        let timeout = self.config.timeouts.liveness();
        let now = self.now();
        let mut check = true;
        let mut missing = Vec::new();
        for kind in BLOCKING_DEVICES {
            if !self.observatory.control(kind).is_alive(timeout)
                && !(self.recover_crashed(kind, false)? && self.observatory.control(kind).is_alive(timeout))
            {
                missing.push(kind.name());
                self.state.record(SafetyEvent::DeviceUnavailable(kind), SafetyLevel::Error, now);
                check = false;
            }
        }
        if !missing.is_empty() {
            error!(devices = ?missing, "Hardware connection timeout");
        }
        if self.state.focus_enabled && !self.observatory.focuser().actor().is_alive(timeout) {
            warn!("Hardware connection timeout: focuser; continuing without focusing");
            self.disable_focus();
        }

        if self.env.conditions.weather_alert() {
            return self.weather_suspension();
        }
        Ok(check)
    }

    fn weather_suspension(&mut self) -> Result<bool, RunError> {
        warn!("Weather alert; closing the observatory");
        let now = self.now();
        self.state.record(SafetyEvent::WeatherSuspension, SafetyLevel::Warning, now);

        let calibration = self.calibrate_at(CalibrationTime::End);
        self.stop_guiding();
        let mut cooler_off = self.env.conditions.is_daytime(now);
        let started = self.now();
        self.shutdown_procedure(calibration, cooler_off)?;

        let min_reopen = self.config.min_reopen_minutes;
        let sleep = if calibration {
            let spent = (self.now() - started).num_milliseconds() as f64 / 1000.0;
            seconds((min_reopen + 3.0) * 60.0 - spent)
        } else {
            seconds(min_reopen * 60.0)
        };

        info!("Disconnecting telescope");
        self.watchdog.ignore(DeviceKind::Telescope);
        let telescope = self.observatory.telescope().actor().clone();
        telescope.disconnect().delivered("Telescope disconnect");
        telescope.stop();
        if !telescope.wait_terminated(self.config.timeouts.coordination()) {
            warn!("Telescope actor did not stop in time");
        }

        info!(minutes = sleep.as_secs() / 60, "Sleeping before weather checks resume");
        if !self.pause(sleep) {
            self.state.end(RunEnding::ShutdownRequested);
            return Ok(false);
        }

        let last_end = self.last_end();
        let weather_freq = self.config.weather_freq();
        while self.env.conditions.weather_alert() {
            if self.env.conditions.is_daytime(self.now()) {
                cooler_off = true;
                self.observatory.camera().set_cooler(false).delivered("Cooler off");
                self.stop_continuous_focus();
                let sunset = self.env.conditions.next_sunset(self.now());
                let resume_at = sunset - minutes(self.config.sunset_lead_minutes);
                info!(%sunset, "Sun is up; observing stops until it sets again");
                while self.now() < resume_at {
                    self.thread_check()?;
                    if self.now() > last_end {
                        return Ok(self.window_closed());
                    }
                    if !self.pause(weather_freq + Duration::from_secs(60)) {
                        self.state.end(RunEnding::ShutdownRequested);
                        return Ok(false);
                    }
                }
                info!("Sun should be setting; resuming weather checks");
            } else {
                self.thread_check()?;
                info!("Still waiting for good conditions to reopen");
                if self.now() > last_end {
                    return Ok(self.window_closed());
                }
                if !self.pause(weather_freq) {
                    self.state.end(RunEnding::ShutdownRequested);
                    return Ok(false);
                }
            }
        }

        if self.now() + minutes(self.config.reopen_margin_minutes) > last_end {
            info!("Weather cleared too late to use the remaining window");
            return Ok(self.window_closed());
        }

        info!("Weather cleared; reopening");
        self.state.record(SafetyEvent::WeatherReopen, SafetyLevel::Info, self.now());
        self.restart(DeviceKind::Telescope)?;
        self.watchdog.resume(DeviceKind::Telescope);
        self.restart(DeviceKind::Dome)?;

        if self.startup(cooler_off)? == StartupOutcome::Aborted {
            return Ok(false);
        }

        if let Some(index) = self.state.current_ticket {
            let ticket = self.tickets[index].clone();
            if ticket.end_utc() > self.now() {
                if self.ticket_slew(&ticket)? != SlewOutcome::OnTarget {
                    return Ok(false);
                }
                if ticket.self_guide {
                    self.start_guiding();
                }
            }
        }
        Ok(true)
    }

    fn window_closed(&mut self) -> bool {
        self.state.end(RunEnding::WeatherWindowClosed);
        false
    }

    /// Opens the dome and readies the telescope and camera. Returns the
    /// shutter state found before opening.
    pub(super) fn startup(&mut self, cooler: bool) -> Result<StartupOutcome, RunError> {
        // Give the first weather poll time to complete.
        self.pause(seconds(self.config.startup_delay_secs));
        let ready = self.everything_ok()?;
        if cooler {
            self.observatory.camera().set_cooler(true).delivered("Cooler on");
        }

        let dome = self.observatory.dome().clone();
        let initial_shutter = dome.shutter_status().unwrap_or_else(|e| {
            warn!(error = %e, "Shutter status unavailable");
            ShutterState::Faulted
        });

        if initial_shutter.needs_opening() && ready {
            info!(shutter = ?initial_shutter, "Opening dome");
            dome.move_shutter(ShutterCommand::Open).delivered("Shutter open");
            dome.home().delivered("Dome home");
        } else if !ready {
            if !self.env.conditions.weather_alert() {
                self.shutdown(false)?;
            }
            return Ok(StartupOutcome::Aborted);
        }

        self.observatory.telescope().unpark().delivered("Unpark");
        self.observatory.camera().cooler_settle().delivered("Cooler settle");
        dome.slave_to_scope(true).delivered("Dome slaving");
        Ok(StartupOutcome::Ready { initial_shutter })
    }

    /// Blocks until a dome opened at startup has homed and its shutter has
    /// finished moving.
    pub(super) fn wait_dome_open(&self) {
        let dome = self.observatory.dome();
        let coordination = self.config.timeouts.coordination();
        if !dome.wait_shutter(self.config.timeouts.shutter()) {
            warn!("Shutter did not finish opening in time");
        }
        if !dome.wait_move(coordination) || !dome.has_homed() {
            warn!("Dome did not finish homing in time");
        }
    }
}
