use super::{CameraKind, DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusRequest {
    pub exposure_secs: f64,
    pub filter_position: u8,
    pub camera: CameraKind,
}

pub trait FocuserDriver: Hardware {
    fn focus_to(&mut self, position: i32) -> Result<(), DeviceError>;
    /// Runs a focus sweep and returns the best focuser position.
    fn auto_focus(&mut self, request: &FocusRequest) -> Result<i32, DeviceError>;
}

#[derive(Debug, Default)]
struct FocuserEvents {
    focused: Signal,
    focus_ok: AtomicBool,
    continuous_stop: Signal,
    continuous_running: AtomicBool,
}

#[derive(Clone)]
pub struct Focuser {
    actor: DeviceActor<Box<dyn FocuserDriver>>,
    events: Arc<FocuserEvents>,
}

fn focus_once(focuser: &mut dyn FocuserDriver, request: &FocusRequest) -> Result<i32, DeviceError> {
    let best = focuser.auto_focus(request)?;
    focuser.focus_to(best)?;
    Ok(best)
}

impl Focuser {
    pub fn start(drivers: Arc<dyn DriverFactory>) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::Focuser, move || drivers.focuser())?;
        Ok(Self {
            actor,
            events: Arc::new(FocuserEvents::default()),
        })
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn FocuserDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn initial_focus(&self, request: FocusRequest) -> Result<(), ActorError> {
        self.events.focused.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |focuser| {
            let result = focus_once(&mut **focuser, &request);
            events.focus_ok.store(result.is_ok(), Ordering::SeqCst);
            events.focused.set();
            let best = result?;
            info!(position = best, "Initial focus complete");
            Ok(())
        })
    }

    /// True if the last focus run succeeded within `timeout`.
    pub fn wait_focus(&self, timeout: Duration) -> bool {
        self.events.focused.wait(timeout) && self.events.focus_ok.load(Ordering::SeqCst)
    }

    /// Whether the last focus run has finished, successfully or not.
    pub fn focus_finished(&self) -> bool {
        self.events.focused.is_set()
    }

    /// Refocuses every `interval` until `stop_continuous` is called. Occupies
    /// the focuser actor for the whole time.
    pub fn continuous_focus(&self, request: FocusRequest, interval: Duration) -> Result<(), ActorError> {
        if self.is_continuous_running() {
            return Ok(());
        }
        self.events.continuous_stop.clear();
        self.events.continuous_running.store(true, Ordering::SeqCst);
        let events = Arc::clone(&self.events);
        let submitted = self.actor.submit(move |focuser| {
            let mut result = Ok(());
            while !events.continuous_stop.is_set() {
                if let Err(e) = focus_once(&mut **focuser, &request) {
                    warn!(error = %e, "Continuous focus run failed");
                    result = Err(e);
                    break;
                }
                events.continuous_stop.wait(interval);
            }
            events.continuous_running.store(false, Ordering::SeqCst);
            result
        });
        if submitted.is_err() {
            self.events.continuous_running.store(false, Ordering::SeqCst);
        }
        submitted
    }

    pub fn stop_continuous(&self) {
        self.events.continuous_stop.set();
    }

    pub fn is_continuous_running(&self) -> bool {
        self.events.continuous_running.load(Ordering::SeqCst)
    }
}
