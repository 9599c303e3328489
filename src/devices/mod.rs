pub mod camera;
pub mod dome;
pub mod focuser;
pub mod guider;
pub mod lamp;
pub mod mirror;
pub mod telescope;

pub use camera::{Camera, CameraDriver, CameraKind, ExposureRequest, FrameType, HeaderValue, StreamRequest};
pub use dome::{Dome, DomeDriver, ShutterCommand, ShutterState};
pub use focuser::{FocusRequest, Focuser, FocuserDriver};
pub use guider::{Guider, GuiderDriver};
pub use lamp::{FlatLamp, LampDriver};
pub use mirror::{MirrorDriver, TertiaryMirror};
pub use telescope::{SlewStatus, Telescope, TelescopeDriver, TrackingRates};

use core::fmt;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_DEVICES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Camera,
    Telescope,
    Dome,
    Focuser,
    Guider,
    TertiaryMirror,
    FlatLamp,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Camera,
        DeviceKind::Telescope,
        DeviceKind::Dome,
        DeviceKind::Focuser,
        DeviceKind::Guider,
        DeviceKind::TertiaryMirror,
        DeviceKind::FlatLamp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Telescope => "telescope",
            DeviceKind::Dome => "dome",
            DeviceKind::Focuser => "focuser",
            DeviceKind::Guider => "guider",
            DeviceKind::TertiaryMirror => "tertiary_mirror",
            DeviceKind::FlatLamp => "flat_lamp",
        }
    }

    /// Whether a liveness timeout on this device blocks observing. The
    /// focuser and guider only degrade the run.
    pub fn is_required(self) -> bool {
        !matches!(self, DeviceKind::Focuser | DeviceKind::Guider)
    }
}

const_assert!(DeviceKind::ALL.len() <= MAX_DEVICES);

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device is not connected")]
    NotConnected,
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("operation not supported by this device")]
    Unsupported,
}

/// The connection surface every vendor driver exposes.
///
/// Implementations are constructed on, and only ever touched from, the
/// owning actor's thread, so they need not be `Send`.
pub trait Hardware {
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self) -> Result<(), DeviceError>;
}

impl<T: Hardware + ?Sized> Hardware for Box<T> {
    fn connect(&mut self) -> Result<(), DeviceError> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        (**self).disconnect()
    }
}

/// Probes the vendor automation processes behind the drivers.
pub trait ProcessMonitor: Send + Sync {
    fn is_responding(&self, program: &str) -> bool;
    fn terminate(&self, program: &str);
}

/// Builds fresh driver instances. Called on the new actor's thread every
/// time an actor is started or replaced.
pub trait DriverFactory: Send + Sync {
    fn camera(&self, kind: CameraKind) -> Box<dyn CameraDriver>;
    fn telescope(&self) -> Box<dyn TelescopeDriver>;
    fn dome(&self) -> Box<dyn DomeDriver>;
    fn focuser(&self) -> Box<dyn FocuserDriver>;
    fn guider(&self) -> Box<dyn GuiderDriver>;
    fn mirror(&self) -> Box<dyn MirrorDriver>;
    fn lamp(&self) -> Box<dyn LampDriver>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceKind::TertiaryMirror).unwrap();
        assert_eq!(json, "\"tertiary_mirror\"");
        let kind: DeviceKind = serde_json::from_str("\"flat_lamp\"").unwrap();
        assert_eq!(kind, DeviceKind::FlatLamp);
    }

    #[test]
    fn test_only_focuser_and_guider_are_optional() {
        let optional: Vec<_> = DeviceKind::ALL.iter().filter(|k| !k.is_required()).collect();
        assert_eq!(optional, vec![&DeviceKind::Focuser, &DeviceKind::Guider]);
    }
}
