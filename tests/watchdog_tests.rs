use chrono::{TimeZone, Utc};
use observatory::actor::ConnectionState;
use observatory::config::{Timeouts, WatchdogConfig};
use observatory::devices::{CameraKind, DeviceKind};
use observatory::observatory::Observatory;
use observatory::safety::SafetyEnvelope;
use observatory::sim::{FaultKind, SimWorld};
use observatory::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;

fn rig() -> (SimWorld, Arc<Watchdog>) {
    let world = SimWorld::new(Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap());
    let watchdog = Arc::new(Watchdog::new(
        WatchdogConfig {
            interval_secs: 0.05,
            liveness_timeout_secs: 0.2,
        },
        SafetyEnvelope::default(),
        world.clock.clone(),
        world.sky.clone(),
    ));
    (world, watchdog)
}

/// Starts every actor and waits for all but `missing` to connect.
fn start(world: &SimWorld, watchdog: &Arc<Watchdog>, missing: Option<DeviceKind>) -> Observatory {
    let observatory = Observatory::start(
        world.drivers.clone(),
        CameraKind::Ccd,
        Timeouts::default(),
        Arc::clone(watchdog),
    )
    .unwrap();
    for kind in DeviceKind::ALL.into_iter().filter(|k| Some(*k) != missing) {
        assert!(observatory.control(kind).is_alive(Duration::from_secs(2)), "{kind} not alive");
    }
    observatory
}

#[test]
fn test_healthy_observatory_reports_nothing() {
    let (world, watchdog) = rig();
    let observatory = start(&world, &watchdog, None);
    watchdog.resume_coordinate_check();
    watchdog.poll_once();
    assert!(watchdog.health().is_healthy());
    observatory.stop_all();
}

#[test]
fn test_device_that_never_connects_is_marked_crashed() {
    let (world, watchdog) = rig();
    world.drivers.inject(DeviceKind::Dome, FaultKind::ConnectFailure, 1);
    let observatory = start(&world, &watchdog, Some(DeviceKind::Dome));

    watchdog.poll_once();
    assert_eq!(watchdog.take_crashed().as_slice(), &[DeviceKind::Dome]);
    assert_eq!(observatory.control(DeviceKind::Dome).state(), ConnectionState::Crashed);
    observatory.stop_all();
}

#[test]
fn test_panicking_driver_is_reported_by_background_thread() {
    let (world, watchdog) = rig();
    let observatory = start(&world, &watchdog, None);
    world.drivers.inject(DeviceKind::FlatLamp, FaultKind::Panic, 1);
    let _ = observatory.lamp().switch(true);
    assert!(observatory
        .control(DeviceKind::FlatLamp)
        .wait_terminated(Duration::from_secs(2)));

    watchdog.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    watchdog.stop();
    assert!(watchdog.health().crashed.contains(&DeviceKind::FlatLamp));
    observatory.stop_all();
}

#[test]
fn test_replaced_actor_is_watched_again() {
    let (world, watchdog) = rig();
    world.drivers.inject(DeviceKind::Guider, FaultKind::ConnectFailure, 1);
    let mut observatory = start(&world, &watchdog, Some(DeviceKind::Guider));
    watchdog.poll_once();
    assert_eq!(watchdog.take_crashed().as_slice(), &[DeviceKind::Guider]);

    observatory.replace(DeviceKind::Guider).unwrap();
    assert!(observatory
        .control(DeviceKind::Guider)
        .is_alive(Duration::from_secs(2)));
    watchdog.poll_once();
    assert!(watchdog.health().crashed.is_empty());
    observatory.stop_all();
}

#[test]
fn test_telescope_below_floor_is_unsafe_only_while_checking() {
    let (world, watchdog) = rig();
    let observatory = start(&world, &watchdog, None);
    world.sky.set_altitude(5.0);

    watchdog.poll_once();
    assert!(watchdog.coordinates_safe());

    watchdog.resume_coordinate_check();
    watchdog.poll_once();
    assert!(!watchdog.coordinates_safe());
    observatory.stop_all();
}

#[test]
fn test_ignored_device_is_not_reported() {
    let (world, watchdog) = rig();
    world.drivers.inject(DeviceKind::Telescope, FaultKind::ConnectFailure, 1);
    let observatory = start(&world, &watchdog, Some(DeviceKind::Telescope));
    watchdog.ignore(DeviceKind::Telescope);
    watchdog.poll_once();
    assert!(watchdog.take_crashed().is_empty());

    watchdog.resume(DeviceKind::Telescope);
    watchdog.poll_once();
    assert_eq!(watchdog.take_crashed().as_slice(), &[DeviceKind::Telescope]);
    observatory.stop_all();
}
