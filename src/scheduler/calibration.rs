use super::{Delivered, RunError, Scheduler};
use crate::devices::{ExposureRequest, FrameType, HeaderValue};
use crate::images::{dark_stem, flat_stem, frame_name};
use crate::ticket::Ticket;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

impl Scheduler {
    pub(super) fn settle_cooler(&self) {
        let camera = self.observatory.camera();
        if camera.cooler_settle().delivered("Cooler settle") && !camera.wait_cooler(self.config.timeouts.cooler()) {
            warn!("Cooler did not settle in time; calibrating anyway");
        }
    }

    /// Flats then darks for every ticket not yet calibrated. At the start
    /// of a session every ticket qualifies; otherwise only tickets whose
    /// start time has passed.
    pub(super) fn take_calibration_images(&mut self, beginning: bool) -> Result<(), RunError> {
        let now = self.now();
        for index in 0..self.tickets.len() {
            if self.state.calibrated[index] {
                continue;
            }
            if !beginning && self.tickets[index].start_utc() > now {
                continue;
            }
            if self.state.shutdown.is_requested() {
                break;
            }
            let ticket = self.tickets[index].clone();
            info!(ticket = %ticket.name, "Taking calibration frames");
            self.take_flats(&ticket)?;
            self.take_darks(&ticket)?;
            self.state.calibrated[index] = true;
        }
        Ok(())
    }

    fn take_flats(&self, ticket: &Ticket) -> Result<(), RunError> {
        let dir = self.options.image_dir.join(format!("Flats_{}", ticket.name));
        let lamp = self.observatory.lamp();
        if dir.exists() {
            info!(ticket = %ticket.name, "Flats already taken; skipping");
            lamp.switch(false).delivered("Lamp off");
            return Ok(());
        }
        fs::create_dir_all(&dir)?;

        if !(lamp.switch(true).delivered("Lamp on") && lamp.wait_lamp(self.config.timeouts.lamp()) && lamp.is_on()) {
            warn!(ticket = %ticket.name, "Flat lamp did not turn on; skipping flats");
            lamp.switch(false).delivered("Lamp off");
            return Ok(());
        }

        for filter in &ticket.filters {
            let (Some(exp), Some(position)) = (self.config.flat_exposure(filter), self.config.filter_position(filter)) else {
                warn!(filter = %filter, "No flat exposure configured for filter");
                continue;
            };
            let stem = flat_stem(exp, filter);
            for n in 1..=self.config.calibration_num {
                let request = ExposureRequest::new(exp, position, dir.join(frame_name(&stem, n)), FrameType::Flat)
                    .with_header("OBJECT", HeaderValue::Text("Flat".into()))
                    .with_header("FILTER", HeaderValue::Text(filter.clone()));
                self.calibration_frame(request);
            }
        }

        if lamp.switch(false).delivered("Lamp off") && !lamp.wait_lamp(self.config.timeouts.lamp()) {
            warn!("Flat lamp did not turn off in time");
        }
        Ok(())
    }

    fn take_darks(&self, ticket: &Ticket) -> Result<(), RunError> {
        let dir = self.options.image_dir.join(format!("Darks_{}", ticket.name));
        if dir.exists() {
            info!(ticket = %ticket.name, "Darks already taken; skipping");
            return Ok(());
        }
        fs::create_dir_all(&dir)?;

        let mut seen = BTreeSet::new();
        let exposures: Vec<f64> = ticket
            .filters
            .iter()
            .filter_map(|filter| self.config.flat_exposure(filter))
            .chain(ticket.exp_times.iter().copied())
            .filter(|exp| seen.insert(format!("{exp:.3}")))
            .collect();

        for exp in exposures {
            let stem = dark_stem(exp);
            for n in 1..=self.config.calibration_num {
                let path: PathBuf = dir.join(frame_name(&stem, n));
                let request = ExposureRequest::new(exp, self.config.dark_filter_position, path, FrameType::Dark)
                    .with_header("OBJECT", HeaderValue::Text("Dark".into()));
                self.calibration_frame(request);
            }
        }
        Ok(())
    }

    fn calibration_frame(&self, request: ExposureRequest) {
        let camera = self.observatory.camera();
        let exp = request.duration_secs;
        let timeout = self.config.timeouts.exposure(exp);
        let name = request.save_path.display().to_string();
        let request = request.with_header("EXPTIME", HeaderValue::Float(exp));
        if !(camera.expose(request).delivered("Calibration exposure") && camera.wait_image(timeout)) {
            warn!(frame = %name, "Calibration frame failed");
        }
    }
}
