use super::{Delivered, RunError, Scheduler};
use crate::clock::{seconds, until};
use crate::devices::{Camera, CameraKind, DeviceKind, ExposureRequest, FrameType, HeaderValue, StreamRequest};
use crate::images::{frame_name, highest_index, light_stem, FrameNumbering};
use crate::satellite::TrackingMode;
use crate::ticket::{PlannedExposure, Ticket};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Poll cadence while a continuous-follow exposure is running.
const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// Time the capture gets to start before the first check.
const CAPTURE_STARTUP: Duration = Duration::from_secs(5);
/// Check cadence of a capture with no satellite to track.
const CAPTURE_CHECK_SECS: f64 = 30.0;
const CAPTURE_MIN_WAIT_SECS: f64 = 1.0;
/// Settling time between pausing a capture and moving the telescope.
const CAPTURE_PAUSE_SETTLE: Duration = Duration::from_millis(500);

/// How a run of exposures ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Batch {
    taken: u32,
    /// False when the ticket window closed or pre-flight failed mid-batch.
    finished: bool,
}

fn chrono_secs(secs: f64) -> ChronoDuration {
    ChronoDuration::from_std(seconds(secs)).unwrap_or_else(|_| ChronoDuration::zero())
}

impl Scheduler {
    /// Points the tertiary mirror at the ticket's camera and swaps the
    /// camera actor when the kind changes.
    pub(super) fn select_camera(&mut self, ticket: &Ticket) -> Result<(), RunError> {
        let kind = ticket.camera.unwrap_or(self.config.default_camera);
        let mirror = self.observatory.mirror();
        if mirror.select_port(kind).delivered("Mirror port") && !mirror.wait_port(self.config.timeouts.coordination()) {
            warn!(camera = %kind, "Mirror did not reach the camera port in time");
        }

        if self.observatory.camera().kind() != kind {
            self.stop_continuous_focus();
            self.observatory.swap_camera(kind)?;
            self.state.focus_request = None;
            self.observatory.camera().cooler_settle().delivered("Cooler settle");
        }
        Ok(())
    }

    /// Takes a ticket's exposures. Returns `(taken, total)`.
    pub(super) fn run_ticket(&mut self, ticket: &Ticket) -> Result<(u32, u32), RunError> {
        let dir = self.ticket_dir(ticket);
        fs::create_dir_all(&dir)?;

        self.start_continuous_focus(ticket);
        if ticket.self_guide {
            self.start_guiding();
        }

        let plan = ticket.planned_exposures();
        let mut taken = 0;
        if self.observatory.camera().kind() == CameraKind::Nir {
            taken = self.stream_images(ticket, &dir)?;
        } else if ticket.cycle_filter {
            taken = self.take_images(ticket, &dir, &plan)?.taken;
        } else {
            for batch in plan.chunks(ticket.num.max(1) as usize) {
                let result = self.take_images(ticket, &dir, batch)?;
                taken += result.taken;
                if !result.finished {
                    break;
                }
            }
        }

        self.stop_continuous_focus();
        self.stop_guiding();
        self.state.satellite = None;
        Ok((taken, ticket.total_exposures()))
    }

    fn take_images(
        &mut self,
        ticket: &Ticket,
        dir: &Path,
        exposures: &[PlannedExposure<'_>],
    ) -> Result<Batch, RunError> {
        let prefix = ticket.image_prefix();
        let mode = ticket.tracking_mode();
        let fov = self.observatory.camera().kind().fov_arcmin();
        if mode == Some(TrackingMode::ContinuousFollow) {
            self.follow_slew();
        }

        let mut numbering = FrameNumbering::new();
        let mut next_check = self.now();
        let mut taken = 0;
        let mut index = 0;
        while index < exposures.len() {
            let exposure = exposures[index];
            if self.now() >= ticket.end_utc() {
                info!(ticket = %ticket.name, "End time reached");
                return Ok(Batch { taken, finished: false });
            }
            if !self.everything_ok()? {
                return Ok(Batch { taken, finished: false });
            }
            if self.crash_check(DeviceKind::Camera)? {
                continue;
            }

            let Some(position) = self.config.filter_position(exposure.filter) else {
                warn!(filter = exposure.filter, "Filter not on the wheel; skipping exposure");
                index += 1;
                continue;
            };
            let stem = light_stem(&prefix, exposure.exp_secs, exposure.filter);
            let number = numbering.current(dir, &stem);
            let path = dir.join(frame_name(&stem, number));

            if let Some(mode) = mode {
                if self.now() >= next_check {
                    let wait = self.tracking_step(mode, fov);
                    // Streak modes aim for the satellite to cross mid-exposure.
                    let lead = if mode == TrackingMode::ContinuousFollow { 0.0 } else { exposure.exp_secs };
                    next_check = self.now() + chrono_secs(wait - lead);
                }
            }

            info!(
                ticket = %ticket.name,
                filter = exposure.filter,
                exp = exposure.exp_secs,
                frame = number,
                "Taking exposure"
            );
            let request = self.exposure_request(ticket, exposure, position, path);
            let camera = self.observatory.camera().clone();
            let done = if !camera.expose(request).delivered("Exposure") {
                false
            } else if mode == Some(TrackingMode::ContinuousFollow) {
                self.follow_exposure(&camera, exposure.exp_secs, fov, &mut next_check)
            } else {
                camera.wait_image(self.config.timeouts.exposure(exposure.exp_secs))
            };
            if done {
                numbering.advance(&stem);
                taken += 1;
            } else {
                warn!(ticket = %ticket.name, frame = number, "Exposure failed or timed out");
                // A camera that died mid-exposure is replaced and the frame retried.
                if self.crash_check(DeviceKind::Camera)? {
                    continue;
                }
            }
            index += 1;
        }

        self.clear_satellite_rates(mode);
        Ok(Batch { taken, finished: true })
    }

    fn clear_satellite_rates(&self, mode: Option<TrackingMode>) {
        if matches!(mode, Some(TrackingMode::ContinuousFollow | TrackingMode::HalfRate)) {
            self.observatory
                .telescope()
                .clear_tracking_rates()
                .delivered("Clear tracking rates");
        }
    }

    /// Takes a ticket on the NIR camera as one continuous capture of the
    /// first exposure time. The run keeps watching the window, the
    /// pre-flight checks and the satellite while frames are written. Streak
    /// modes hold the capture while the telescope moves. Returns the number
    /// of frames written.
    fn stream_images(&mut self, ticket: &Ticket, dir: &Path) -> Result<u32, RunError> {
        let Some(&exp_secs) = ticket.exp_times.first() else {
            return Ok(0);
        };
        let stem = format!("{}_{exp_secs:.3}s", ticket.image_prefix());
        let mode = ticket.tracking_mode();
        let fov = CameraKind::Nir.fov_arcmin();
        let request_timeout = self.config.timeouts.request();
        if mode == Some(TrackingMode::ContinuousFollow) {
            self.follow_slew();
        }

        let before = highest_index(dir, &stem);
        info!(ticket = %ticket.name, exp = exp_secs, frames = ticket.num, "Starting NIR capture");
        let request = StreamRequest {
            exp_secs,
            frames: ticket.num,
            save_dir: dir.to_path_buf(),
            stem: stem.clone(),
        };
        if self.observatory.camera().start_exposing(request).delivered("Start exposing") {
            self.pause(CAPTURE_STARTUP);
        }

        let mut next_check = self.now();
        let mut wait = CAPTURE_CHECK_SECS;
        loop {
            if self.now() >= ticket.end_utc() {
                info!(ticket = %ticket.name, "End time reached");
                break;
            }
            if !self.everything_ok()? {
                break;
            }
            // A restarted camera has no capture and reports done.
            let camera = self.observatory.camera().clone();
            if let Err(e) = camera.check_exposing(request_timeout) {
                warn!(error = %e, "NIR capture status unavailable");
            }
            if camera.exp_done() {
                break;
            }

            match mode {
                Some(mode) if self.now() >= next_check => {
                    let holds = matches!(mode, TrackingMode::StationaryLead | TrackingMode::HalfRate);
                    if holds {
                        camera.pause_exposing(request_timeout).delivered("Pause exposing");
                        self.pause(CAPTURE_PAUSE_SETTLE);
                    }
                    wait = self.tracking_step(mode, fov);
                    next_check = self.now() + chrono_secs(wait - 1.0);
                    if holds {
                        camera.resume_exposing(request_timeout).delivered("Resume exposing");
                    }
                }
                Some(_) => {}
                None => wait = CAPTURE_CHECK_SECS,
            }
            let remaining = until(self.now(), ticket.end_utc());
            if !self.pause(seconds(wait.max(CAPTURE_MIN_WAIT_SECS)).min(remaining)) {
                break;
            }
        }

        self.observatory
            .camera()
            .stop_exposing(request_timeout)
            .delivered("Stop exposing");
        self.clear_satellite_rates(mode);
        let taken = highest_index(dir, &stem).saturating_sub(before);
        info!(ticket = %ticket.name, frames = taken, "NIR capture finished");
        Ok(taken)
    }

    /// Waits for a continuous-follow exposure, re-checking the follow while
    /// the shutter is open.
    fn follow_exposure(
        &mut self,
        camera: &Camera,
        exp_secs: f64,
        fov_arcmin: f64,
        next_check: &mut DateTime<Utc>,
    ) -> bool {
        let deadline = Instant::now() + self.config.timeouts.exposure(exp_secs);
        loop {
            if camera.wait_image(FOLLOW_POLL) {
                return true;
            }
            if camera.poll_image().is_ok() || Instant::now() >= deadline {
                return false;
            }
            if self.now() >= *next_check {
                let wait = self.tracking_step(TrackingMode::ContinuousFollow, fov_arcmin);
                *next_check = self.now() + chrono_secs(wait);
            }
        }
    }

    fn exposure_request(
        &self,
        ticket: &Ticket,
        exposure: PlannedExposure<'_>,
        position: u8,
        path: PathBuf,
    ) -> ExposureRequest {
        let now = self.now();
        let site = &self.config.site;
        let mut request = ExposureRequest::new(exposure.exp_secs, position, path, FrameType::Light)
            .with_header("OBJECT", HeaderValue::Text(ticket.name.clone()))
            .with_header("EXPTIME", HeaderValue::Float(exposure.exp_secs))
            .with_header("FILTER", HeaderValue::Text(exposure.filter.to_string()))
            .with_header("CAMERA", HeaderValue::Text(self.observatory.camera().kind().to_string()))
            .with_header("SITELAT", HeaderValue::Float(site.latitude_deg))
            .with_header("SITELONG", HeaderValue::Float(site.longitude_deg))
            .with_header("SITEALT", HeaderValue::Float(site.altitude_m))
            .with_header(
                "DATE-OBS",
                HeaderValue::Text(now.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
            );

        let target = match &self.state.satellite {
            Some(satellite) => Some(satellite.position(now)),
            None => ticket.target(),
        };
        if let Some(target) = target {
            request = request
                .with_header("RA_OBJ", HeaderValue::Float(target.ra_hours * 15.0))
                .with_header("DEC_OBJ", HeaderValue::Float(target.dec_deg))
                .with_header(
                    "ALT_OBJ",
                    HeaderValue::Float(self.env.astrometry.altitude_deg(target, now)),
                )
                .with_header(
                    "HA_OBJ",
                    HeaderValue::Float(self.env.astrometry.hour_angle_hours(target, now)),
                );
        }

        if let (Some(mode), Some(satellite)) = (ticket.tracking_mode(), &self.state.satellite) {
            let rates = satellite.rates(now);
            request = request
                .with_header("TRKMODE", HeaderValue::Int(i64::from(u8::from(mode))))
                .with_header("RARATE", HeaderValue::Float(rates.ra))
                .with_header("DECRATE", HeaderValue::Float(rates.dec));
        }
        request
    }
}
