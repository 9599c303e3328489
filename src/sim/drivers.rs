//! Simulated vendor drivers.
//!
//! Device state that outlives a single driver instance (shutter position,
//! mount pointing, scripted slew results) lives in [`SimDrivers`], so a
//! restarted actor sees the same world as the one it replaced.

use super::faults::{FaultInjector, FaultKind, Operation};
use super::{Event, EventLog, SimClock};
use crate::astrometry::Equatorial;
use crate::clock::Clock;
use crate::devices::{
    CameraDriver, CameraKind, DeviceError, DeviceKind, DomeDriver, DriverFactory, ExposureRequest,
    FocusRequest, FocuserDriver, FrameType, GuiderDriver, Hardware, LampDriver, MirrorDriver,
    ShutterCommand, ShutterState, SlewStatus, StreamRequest, TelescopeDriver, TrackingRates,
};
use crate::images::{frame_name, highest_index};
use crate::signal::lock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Best focuser position reported by every simulated focus run.
const BEST_FOCUS: i32 = 5000;

#[derive(Debug)]
struct World {
    shutter: ShutterState,
    position: Equatorial,
    rates: TrackingRates,
    parked: bool,
    slew_script: VecDeque<SlewStatus>,
    park_script: VecDeque<SlewStatus>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            shutter: ShutterState::Closed,
            position: Equatorial::new(0.0, 45.0),
            rates: TrackingRates::default(),
            parked: true,
            slew_script: VecDeque::new(),
            park_script: VecDeque::new(),
        }
    }
}

/// What every simulated driver shares.
#[derive(Clone)]
struct Link {
    kind: DeviceKind,
    clock: Arc<SimClock>,
    events: EventLog,
    world: Arc<Mutex<World>>,
    faults: Arc<Mutex<FaultInjector>>,
}

impl Link {
    fn inject(&self, operation: Operation) -> Result<(), DeviceError> {
        // The guard must be gone before a scripted panic unwinds.
        let fault = lock(&self.faults).check(self.kind, operation);
        match fault {
            None => Ok(()),
            Some(FaultKind::ConnectFailure) => Err(DeviceError::CommandFailed(format!(
                "{} refused the connection",
                self.kind
            ))),
            Some(FaultKind::CommandFailure) => Err(DeviceError::CommandFailed(format!(
                "{} command failed",
                self.kind
            ))),
            Some(FaultKind::Panic) => panic!("simulated {} driver fault", self.kind),
        }
    }

    fn command(&self) -> Result<(), DeviceError> {
        self.inject(Operation::Command)
    }

    fn world(&self) -> MutexGuard<'_, World> {
        lock(&self.world)
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        self.inject(Operation::Connect)?;
        self.events.record(Event::Connected(self.kind));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.events.record(Event::Disconnected(self.kind));
        Ok(())
    }
}

struct SimCamera {
    link: Link,
    kind: CameraKind,
    capture: Option<Capture>,
}

/// A running NIR capture. Frames land on disk as the virtual clock passes
/// their end time.
#[derive(Debug)]
struct Capture {
    request: StreamRequest,
    next_index: u32,
    written: u32,
    /// Start of the frame in progress; `None` while paused.
    frame_started: Option<DateTime<Utc>>,
}

impl SimCamera {
    fn streaming(&self) -> Result<(), DeviceError> {
        match self.kind {
            CameraKind::Nir => Ok(()),
            CameraKind::Ccd => Err(DeviceError::Unsupported),
        }
    }

    /// Writes every frame the capture has finished by now.
    fn catch_up(&mut self) -> Result<(), DeviceError> {
        let now = self.link.clock.now();
        let Some(capture) = self.capture.as_mut() else {
            return Ok(());
        };
        let exposure = ChronoDuration::milliseconds((capture.request.exp_secs.max(0.0) * 1000.0).round() as i64);
        while capture.written < capture.request.frames {
            let Some(started) = capture.frame_started else {
                break;
            };
            if started + exposure > now {
                break;
            }
            let path = capture
                .request
                .save_dir
                .join(frame_name(&capture.request.stem, capture.next_index));
            File::create(&path)
                .map_err(|e| DeviceError::CommandFailed(format!("cannot write {}: {e}", path.display())))?;
            self.link.events.record(Event::Exposure {
                camera: self.kind,
                path,
                filter_position: 0,
                duration_secs: capture.request.exp_secs,
                frame: FrameType::Light,
            });
            capture.next_index += 1;
            capture.written += 1;
            capture.frame_started = Some(started + exposure);
        }
        Ok(())
    }

    fn capture(&mut self) -> Result<&mut Capture, DeviceError> {
        self.capture
            .as_mut()
            .ok_or_else(|| DeviceError::CommandFailed("no capture running".into()))
    }
}

struct SimTelescope {
    link: Link,
}

struct SimDome {
    link: Link,
}

struct SimFocuser {
    link: Link,
}

struct SimGuider {
    link: Link,
}

struct SimMirror {
    link: Link,
}

struct SimLamp {
    link: Link,
}

macro_rules! linked_hardware {
    ($($driver:ty),+ $(,)?) => {
        $(
            impl Hardware for $driver {
                fn connect(&mut self) -> Result<(), DeviceError> {
                    self.link.connect()
                }

                fn disconnect(&mut self) -> Result<(), DeviceError> {
                    self.link.disconnect()
                }
            }
        )+
    };
}

linked_hardware!(SimCamera, SimTelescope, SimDome, SimFocuser, SimGuider, SimMirror, SimLamp);

impl CameraDriver for SimCamera {
    fn expose(&mut self, request: &ExposureRequest) -> Result<(), DeviceError> {
        self.link.command()?;
        File::create(&request.save_path)
            .map_err(|e| DeviceError::CommandFailed(format!("cannot write {}: {e}", request.save_path.display())))?;
        self.link
            .clock
            .advance(Duration::from_secs_f64(request.duration_secs.max(0.0)));
        self.link.events.record(Event::Exposure {
            camera: self.kind,
            path: request.save_path.clone(),
            filter_position: request.filter_position,
            duration_secs: request.duration_secs,
            frame: request.frame,
        });
        Ok(())
    }

    fn set_cooler(&mut self, on: bool) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::Cooler(on));
        Ok(())
    }

    fn cooler_settle(&mut self) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::CoolerSettled);
        Ok(())
    }

    fn start_exposing(&mut self, request: &StreamRequest) -> Result<(), DeviceError> {
        self.streaming()?;
        self.link.command()?;
        self.capture = Some(Capture {
            request: request.clone(),
            next_index: highest_index(&request.save_dir, &request.stem) + 1,
            written: 0,
            frame_started: Some(self.link.clock.now()),
        });
        self.link.events.record(Event::CaptureStarted);
        Ok(())
    }

    fn pause_exposing(&mut self) -> Result<(), DeviceError> {
        self.streaming()?;
        self.link.command()?;
        self.catch_up()?;
        self.capture()?.frame_started = None;
        self.link.events.record(Event::CapturePaused);
        Ok(())
    }

    fn resume_exposing(&mut self) -> Result<(), DeviceError> {
        self.streaming()?;
        self.link.command()?;
        let now = self.link.clock.now();
        let capture = self.capture()?;
        if capture.frame_started.is_none() {
            capture.frame_started = Some(now);
        }
        self.link.events.record(Event::CaptureResumed);
        Ok(())
    }

    fn exposing_done(&mut self) -> Result<bool, DeviceError> {
        self.catch_up()?;
        Ok(match &self.capture {
            Some(capture) => capture.written >= capture.request.frames,
            None => true,
        })
    }

    fn stop_exposing(&mut self) -> Result<(), DeviceError> {
        self.catch_up()?;
        if self.capture.take().is_some() {
            self.link.events.record(Event::CaptureStopped);
        }
        Ok(())
    }
}

impl TelescopeDriver for SimTelescope {
    fn slew(&mut self, target: Equatorial, _tracking: bool) -> Result<SlewStatus, DeviceError> {
        self.link.command()?;
        let status = {
            let mut world = self.link.world();
            let status = world.slew_script.pop_front().unwrap_or(SlewStatus::Success);
            if status == SlewStatus::Success {
                world.position = target;
                world.parked = false;
            }
            status
        };
        self.link.events.record(Event::Slew { target, status });
        Ok(status)
    }

    fn park(&mut self) -> Result<SlewStatus, DeviceError> {
        self.link.command()?;
        let status = {
            let mut world = self.link.world();
            let status = world.park_script.pop_front().unwrap_or(SlewStatus::Success);
            if status == SlewStatus::Success {
                world.parked = true;
                world.rates = TrackingRates::default();
            }
            status
        };
        self.link.events.record(Event::TelescopePark);
        Ok(status)
    }

    fn unpark(&mut self) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.world().parked = false;
        self.link.events.record(Event::TelescopeUnpark);
        Ok(())
    }

    fn set_tracking_rates(&mut self, rates: TrackingRates) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.world().rates = rates;
        self.link.events.record(Event::TrackingRates(rates));
        Ok(())
    }

    fn position(&mut self) -> Result<Equatorial, DeviceError> {
        Ok(self.link.world().position)
    }

    fn tracking_rates(&mut self) -> Result<TrackingRates, DeviceError> {
        Ok(self.link.world().rates)
    }
}

impl DomeDriver for SimDome {
    fn shutter_status(&mut self) -> Result<ShutterState, DeviceError> {
        Ok(self.link.world().shutter)
    }

    fn move_shutter(&mut self, command: ShutterCommand) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.world().shutter = match command {
            ShutterCommand::Open => ShutterState::Open,
            ShutterCommand::Close => ShutterState::Closed,
        };
        self.link.events.record(Event::Shutter(command));
        Ok(())
    }

    fn home(&mut self) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::DomeHome);
        Ok(())
    }

    fn park(&mut self) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::DomePark);
        Ok(())
    }

    fn slave_to_scope(&mut self, slaved: bool) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::DomeSlaved(slaved));
        Ok(())
    }
}

impl FocuserDriver for SimFocuser {
    fn focus_to(&mut self, position: i32) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::FocusTo(position));
        Ok(())
    }

    fn auto_focus(&mut self, _request: &FocusRequest) -> Result<i32, DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::AutoFocus);
        Ok(BEST_FOCUS)
    }
}

impl GuiderDriver for SimGuider {
    fn guide_step(&mut self) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::GuideStep);
        Ok(())
    }
}

impl MirrorDriver for SimMirror {
    fn select_port(&mut self, camera: CameraKind) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::MirrorPort(camera));
        Ok(())
    }
}

impl LampDriver for SimLamp {
    fn set_lamp(&mut self, on: bool) -> Result<(), DeviceError> {
        self.link.command()?;
        self.link.events.record(Event::Lamp(on));
        Ok(())
    }
}

/// Builds simulated drivers that share one world.
pub struct SimDrivers {
    clock: Arc<SimClock>,
    events: EventLog,
    world: Arc<Mutex<World>>,
    faults: Arc<Mutex<FaultInjector>>,
}

impl SimDrivers {
    pub fn new(clock: Arc<SimClock>, events: EventLog) -> Self {
        Self {
            clock,
            events,
            world: Arc::new(Mutex::new(World::default())),
            faults: Arc::new(Mutex::new(FaultInjector::new())),
        }
    }

    /// Queues results for the next slews; later slews succeed.
    pub fn script_slews(&self, statuses: impl IntoIterator<Item = SlewStatus>) {
        lock(&self.world).slew_script.extend(statuses);
    }

    /// Queues results for the next parks; later parks succeed.
    pub fn script_parks(&self, statuses: impl IntoIterator<Item = SlewStatus>) {
        lock(&self.world).park_script.extend(statuses);
    }

    /// Makes the next `count` matching operations on `kind` fail.
    pub fn inject(&self, kind: DeviceKind, fault: FaultKind, count: u32) -> bool {
        lock(&self.faults).script(kind, fault, count)
    }

    pub fn faults(&self) -> MutexGuard<'_, FaultInjector> {
        lock(&self.faults)
    }

    pub fn set_shutter(&self, state: ShutterState) {
        lock(&self.world).shutter = state;
    }

    pub fn set_position(&self, position: Equatorial) {
        lock(&self.world).position = position;
    }

    pub fn shutter(&self) -> ShutterState {
        lock(&self.world).shutter
    }

    pub fn is_parked(&self) -> bool {
        lock(&self.world).parked
    }

    fn link(&self, kind: DeviceKind) -> Link {
        Link {
            kind,
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
            world: Arc::clone(&self.world),
            faults: Arc::clone(&self.faults),
        }
    }
}

impl DriverFactory for SimDrivers {
    fn camera(&self, kind: CameraKind) -> Box<dyn CameraDriver> {
        Box::new(SimCamera {
            link: self.link(DeviceKind::Camera),
            kind,
            capture: None,
        })
    }

    fn telescope(&self) -> Box<dyn TelescopeDriver> {
        Box::new(SimTelescope {
            link: self.link(DeviceKind::Telescope),
        })
    }

    fn dome(&self) -> Box<dyn DomeDriver> {
        Box::new(SimDome {
            link: self.link(DeviceKind::Dome),
        })
    }

    fn focuser(&self) -> Box<dyn FocuserDriver> {
        Box::new(SimFocuser {
            link: self.link(DeviceKind::Focuser),
        })
    }

    fn guider(&self) -> Box<dyn GuiderDriver> {
        Box::new(SimGuider {
            link: self.link(DeviceKind::Guider),
        })
    }

    fn mirror(&self) -> Box<dyn MirrorDriver> {
        Box::new(SimMirror {
            link: self.link(DeviceKind::TertiaryMirror),
        })
    }

    fn lamp(&self) -> Box<dyn LampDriver> {
        Box::new(SimLamp {
            link: self.link(DeviceKind::FlatLamp),
        })
    }
}
