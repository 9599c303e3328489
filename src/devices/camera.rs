use super::{DeviceError, DeviceKind, DriverFactory, Hardware};
use crate::actor::{ActorError, DeviceActor, DeviceControl};
use crate::signal::Signal;
use arrayvec::ArrayString;
use core::convert::Infallible;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// FITS header keywords are at most eight characters.
pub type HeaderKey = ArrayString<8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CameraKind {
    #[default]
    #[serde(rename = "CCD", alias = "ccd")]
    Ccd,
    #[serde(rename = "NIR", alias = "nir")]
    Nir,
}

impl CameraKind {
    /// Field of view in arcminutes.
    pub fn fov_arcmin(self) -> f64 {
        match self {
            CameraKind::Ccd => 26.0,
            CameraKind::Nir => 10.0,
        }
    }
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraKind::Ccd => f.write_str("CCD"),
            CameraKind::Nir => f.write_str("NIR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Light,
    Dark,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Text(String),
    Float(f64),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    pub duration_secs: f64,
    pub filter_position: u8,
    pub save_path: PathBuf,
    pub frame: FrameType,
    pub header: Vec<(HeaderKey, HeaderValue)>,
}

impl ExposureRequest {
    pub fn new(duration_secs: f64, filter_position: u8, save_path: PathBuf, frame: FrameType) -> Self {
        Self {
            duration_secs,
            filter_position,
            save_path,
            frame,
            header: Vec::new(),
        }
    }

    /// Adds a header card. Keywords longer than eight characters are dropped.
    #[must_use]
    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        if let Ok(key) = HeaderKey::from(key) {
            self.header.push((key, value));
        }
        self
    }

    pub fn header_value(&self, key: &str) -> Option<&HeaderValue> {
        self.header
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }
}

/// A continuous capture: the camera writes `frames` images of `exp_secs`
/// each into `save_dir` without a command per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub exp_secs: f64,
    pub frames: u32,
    pub save_dir: PathBuf,
    /// Frames are named `{stem}-NNNN.fits`.
    pub stem: String,
}

pub trait CameraDriver: Hardware {
    fn expose(&mut self, request: &ExposureRequest) -> Result<(), DeviceError>;
    fn set_cooler(&mut self, on: bool) -> Result<(), DeviceError>;
    /// Blocks until the sensor temperature has settled at its setpoint.
    fn cooler_settle(&mut self) -> Result<(), DeviceError>;

    /// Starts a capture and returns while it runs.
    fn start_exposing(&mut self, _request: &StreamRequest) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }

    /// Holds the capture. A frame cut short by the pause is discarded.
    fn pause_exposing(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }

    fn resume_exposing(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported)
    }

    /// True when no capture is running, including after the last frame.
    fn exposing_done(&mut self) -> Result<bool, DeviceError> {
        Ok(true)
    }

    fn stop_exposing(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CameraEvents {
    image_done: Signal,
    image_ok: AtomicBool,
    cooler_settled: Signal,
    cooler_on: Signal,
    exp_done: Signal,
}

/// Handle to the camera actor.
#[derive(Clone)]
pub struct Camera {
    kind: CameraKind,
    actor: DeviceActor<Box<dyn CameraDriver>>,
    events: Arc<CameraEvents>,
}

impl Camera {
    pub fn start(kind: CameraKind, drivers: Arc<dyn DriverFactory>) -> Result<Self, ActorError> {
        let actor = DeviceActor::start(DeviceKind::Camera, move || drivers.camera(kind))?;
        Ok(Self {
            kind,
            actor,
            events: Arc::new(CameraEvents::default()),
        })
    }

    pub fn kind(&self) -> CameraKind {
        self.kind
    }

    pub fn actor(&self) -> &DeviceActor<Box<dyn CameraDriver>> {
        &self.actor
    }

    pub fn control(&self) -> Arc<dyn DeviceControl> {
        Arc::new(self.actor.clone())
    }

    pub fn expose(&self, request: ExposureRequest) -> Result<(), ActorError> {
        self.events.image_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |camera| {
            let result = camera.expose(&request);
            events.image_ok.store(result.is_ok(), Ordering::SeqCst);
            events.image_done.set();
            result
        })
    }

    /// Waits for the current exposure. Returns true only if it completed
    /// successfully within `timeout`.
    pub fn wait_image(&self, timeout: Duration) -> bool {
        self.events.image_done.wait(timeout) && self.events.image_ok.load(Ordering::SeqCst)
    }

    pub fn poll_image(&self) -> nb::Result<(), Infallible> {
        self.events.image_done.poll()
    }

    pub fn last_image_ok(&self) -> bool {
        self.events.image_ok.load(Ordering::SeqCst)
    }

    pub fn set_cooler(&self, on: bool) -> Result<(), ActorError> {
        let events = Arc::clone(&self.events);
        self.actor.submit(move |camera| {
            camera.set_cooler(on)?;
            if on {
                events.cooler_on.set();
            } else {
                events.cooler_on.clear();
                events.cooler_settled.clear();
            }
            Ok(())
        })
    }

    pub fn cooler_on(&self) -> bool {
        self.events.cooler_on.is_set()
    }

    /// Turns the cooler on and waits for it to settle, on the actor thread.
    pub fn cooler_settle(&self) -> Result<(), ActorError> {
        self.events.cooler_settled.clear();
        self.set_cooler(true)?;
        let events = Arc::clone(&self.events);
        self.actor.submit(move |camera| {
            camera.cooler_settle()?;
            events.cooler_settled.set();
            Ok(())
        })
    }

    pub fn wait_cooler(&self, timeout: Duration) -> bool {
        self.events.cooler_settled.wait(timeout)
    }

    /// Starts a continuous capture. A capture that fails to start counts
    /// as done.
    pub fn start_exposing(&self, request: StreamRequest) -> Result<(), ActorError> {
        self.events.exp_done.clear();
        let events = Arc::clone(&self.events);
        self.actor.submit(move |camera| {
            let result = camera.start_exposing(&request);
            if result.is_err() {
                events.exp_done.set();
            }
            result
        })
    }

    /// Pauses the running capture and waits for the camera to confirm.
    pub fn pause_exposing(&self, timeout: Duration) -> Result<(), ActorError> {
        self.actor.request(|camera| camera.pause_exposing(), timeout)
    }

    pub fn resume_exposing(&self, timeout: Duration) -> Result<(), ActorError> {
        self.actor.request(|camera| camera.resume_exposing(), timeout)
    }

    /// Asks the camera whether the capture has finished and latches the
    /// answer into [`Camera::exp_done`].
    pub fn check_exposing(&self, timeout: Duration) -> Result<bool, ActorError> {
        let events = Arc::clone(&self.events);
        self.actor.request(
            move |camera| {
                let done = camera.exposing_done()?;
                if done {
                    events.exp_done.set();
                }
                Ok(done)
            },
            timeout,
        )
    }

    pub fn exp_done(&self) -> bool {
        self.events.exp_done.is_set()
    }

    /// Ends the capture. Frames already written stay on disk.
    pub fn stop_exposing(&self, timeout: Duration) -> Result<(), ActorError> {
        let events = Arc::clone(&self.events);
        self.actor.request(
            move |camera| {
                camera.stop_exposing()?;
                events.exp_done.set();
                Ok(())
            },
            timeout,
        )
    }
}
