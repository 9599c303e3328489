use observatory::actor::{ActorError, ActorHealth, ConnectionState, DeviceActor};
use observatory::devices::{DeviceError, DeviceKind, Hardware};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

/// Hardware that records which commands reached it.
#[derive(Default)]
struct Recorder {
    log: Arc<Mutex<Vec<u32>>>,
}

impl Hardware for Recorder {
    fn connect(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

fn recorder(kind: DeviceKind) -> (DeviceActor<Recorder>, Arc<Mutex<Vec<u32>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);
    let actor = DeviceActor::start(kind, move || Recorder { log: shared }).unwrap();
    assert!(actor.is_alive(WAIT));
    (actor, log)
}

fn push(actor: &DeviceActor<Recorder>, value: u32) {
    actor
        .submit(move |hw: &mut Recorder| {
            hw.log.lock().unwrap().push(value);
            Ok(())
        })
        .unwrap();
}

/// Blocks until everything queued before it has run.
fn drain(actor: &DeviceActor<Recorder>) {
    actor.request(|_| Ok(()), WAIT).unwrap();
}

#[test]
fn test_commands_run_in_submission_order() {
    let (actor, log) = recorder(DeviceKind::Telescope);
    for value in 0..50 {
        push(&actor, value);
    }
    drain(&actor);
    assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
    actor.stop();
    assert!(actor.wait_terminated(WAIT));
}

#[test]
fn test_submissions_from_many_threads_all_run() {
    let (actor, log) = recorder(DeviceKind::Camera);
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let actor = actor.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    push(&actor, t * 100 + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drain(&actor);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 40);
    for t in 0..4 {
        let from_thread: Vec<u32> = log.iter().copied().filter(|v| v / 100 == t).collect();
        assert_eq!(from_thread, (0..10).map(|i| t * 100 + i).collect::<Vec<_>>());
    }
    actor.stop();
}

#[test]
fn test_crashed_actor_holds_commands_until_cleared() {
    let (actor, log) = recorder(DeviceKind::Dome);
    actor.mark_crashed();
    push(&actor, 1);
    thread::sleep(Duration::from_millis(150));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(actor.health(Duration::ZERO), ActorHealth::Dead);

    actor.clear_crashed();
    drain(&actor);
    assert_eq!(*log.lock().unwrap(), vec![1]);
    assert_eq!(actor.state(), ConnectionState::Crashed);
    actor.stop();
}

#[test]
fn test_stopping_crashed_actor_discards_queue() {
    let (actor, log) = recorder(DeviceKind::Guider);
    actor.mark_crashed();
    push(&actor, 1);
    push(&actor, 2);
    actor.stop();
    assert!(actor.wait_terminated(WAIT));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_stop_drains_queued_commands() {
    let (actor, log) = recorder(DeviceKind::FlatLamp);
    for value in 0..5 {
        push(&actor, value);
    }
    actor.stop();
    assert!(actor.wait_terminated(WAIT));
    assert_eq!(log.lock().unwrap().len(), 5);
    assert_eq!(actor.health(Duration::ZERO), ActorHealth::Stopped);
}

#[test]
fn test_submit_after_stop_fails() {
    let (actor, _log) = recorder(DeviceKind::TertiaryMirror);
    actor.stop();
    assert_eq!(
        actor.submit(|_| Ok(())),
        Err(ActorError::Stopped(DeviceKind::TertiaryMirror))
    );
}

#[test]
fn test_panicking_command_crashes_actor() {
    let (actor, log) = recorder(DeviceKind::Focuser);
    actor
        .submit(|_| -> Result<(), DeviceError> { panic!("driver fault") })
        .unwrap();
    assert!(actor.wait_terminated(WAIT));
    assert!(actor.is_crashed());
    assert_eq!(actor.state(), ConnectionState::Crashed);
    assert_eq!(actor.health(Duration::ZERO), ActorHealth::Dead);

    // The thread is gone, so nothing queued afterwards ever runs.
    let _ = actor.submit(|hw: &mut Recorder| {
        hw.log.lock().unwrap().push(9);
        Ok(())
    });
    thread::sleep(Duration::from_millis(50));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_request_times_out_behind_long_command() {
    let (actor, _log) = recorder(DeviceKind::Camera);
    actor
        .submit(|_| {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .unwrap();
    let answer: Result<u8, _> = actor.request(|_| Ok(1), Duration::from_millis(20));
    assert_eq!(answer, Err(ActorError::Timeout(DeviceKind::Camera)));
    actor.stop();
    assert!(actor.wait_terminated(WAIT));
}
