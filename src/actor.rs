//! Per-device actors.
//!
//! Every piece of hardware is owned by exactly one OS thread. Callers never
//! see the driver handle; they enqueue closures that the actor thread runs
//! in submission order, and coordinate completion through device signals.

use crate::devices::{DeviceError, DeviceKind, Hardware};
use crate::signal::{lock, Signal};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How often a crashed actor re-checks whether it was cleared or stopped.
const CRASH_HOLD_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Crashed,
}

/// Health classification reported to the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorHealth {
    Alive,
    Dead,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    #[error("{0} actor has been stopped")]
    Stopped(DeviceKind),
    #[error("{0} actor did not answer within the timeout")]
    Timeout(DeviceKind),
    #[error("{0} actor crashed while handling the request")]
    Crashed(DeviceKind),
    #[error("{kind} device error: {source}")]
    Device {
        kind: DeviceKind,
        #[source]
        source: DeviceError,
    },
    #[error("failed to spawn {kind} actor thread: {reason}")]
    Spawn { kind: DeviceKind, reason: String },
}

type Job<H> = Box<dyn FnOnce(&mut H) -> Result<(), DeviceError> + Send + 'static>;

enum Envelope<H> {
    Run(Job<H>),
    Connect,
    Disconnect,
    Stop,
}

#[derive(Debug)]
struct Shared {
    kind: DeviceKind,
    state: Mutex<ConnectionState>,
    liveness: Signal,
    crashed: Signal,
    stopping: AtomicBool,
    terminated: Signal,
}

impl Shared {
    fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ConnectionState::Disconnected),
            liveness: Signal::new(),
            crashed: Signal::new(),
            stopping: AtomicBool::new(false),
            terminated: Signal::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn mark_crashed(&self) {
        self.crashed.set();
        self.set_state(ConnectionState::Crashed);
        self.liveness.clear();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Sets the terminated signal however the actor thread exits.
struct TerminationGuard(Arc<Shared>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.0.liveness.clear();
        self.0.terminated.set();
    }
}

/// Cloneable handle to one device actor.
pub struct DeviceActor<H> {
    shared: Arc<Shared>,
    sender: Sender<Envelope<H>>,
}

impl<H> Clone for DeviceActor<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            sender: self.sender.clone(),
        }
    }
}

impl<H: Hardware + 'static> DeviceActor<H> {
    /// Spawns the actor thread. `factory` runs on that thread, so the driver
    /// handle is created where it will live.
    pub fn spawn<F>(kind: DeviceKind, factory: F) -> Result<Self, ActorError>
    where
        F: FnOnce() -> H + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new(kind));
        let worker = Arc::clone(&shared);

        thread::Builder::new()
            .name(format!("{kind}-actor"))
            .spawn(move || {
                let guard = TerminationGuard(worker);
                let mut hardware = factory();
                run(&guard.0, &mut hardware, &receiver);
                debug!(kind = %guard.0.kind, "Actor thread exiting");
            })
            .map_err(|e| ActorError::Spawn {
                kind,
                reason: e.to_string(),
            })?;

        Ok(Self { shared, sender })
    }

    /// Spawns the actor and queues the connection handshake.
    pub fn start<F>(kind: DeviceKind, factory: F) -> Result<Self, ActorError>
    where
        F: FnOnce() -> H + Send + 'static,
    {
        let actor = Self::spawn(kind, factory)?;
        actor.connect()?;
        Ok(actor)
    }

    pub fn kind(&self) -> DeviceKind {
        self.shared.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Enqueues a command. Returns immediately; the command runs on the
    /// actor thread after everything submitted before it.
    pub fn submit<F>(&self, job: F) -> Result<(), ActorError>
    where
        F: FnOnce(&mut H) -> Result<(), DeviceError> + Send + 'static,
    {
        self.send(Envelope::Run(Box::new(job)))
    }

    /// Runs a query on the actor thread and waits up to `timeout` for its answer.
    pub fn request<R, F>(&self, query: F, timeout: Duration) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: FnOnce(&mut H) -> Result<R, DeviceError> + Send + 'static,
    {
        let kind = self.kind();
        let (reply, answer) = crossbeam_channel::bounded(1);
        self.submit(move |hardware| {
            // The requester may have given up already.
            let _ = reply.send(query(hardware));
            Ok(())
        })?;

        match answer.recv_timeout(timeout) {
            Ok(result) => result.map_err(|source| ActorError::Device { kind, source }),
            Err(RecvTimeoutError::Timeout) => Err(ActorError::Timeout(kind)),
            Err(RecvTimeoutError::Disconnected) => Err(ActorError::Crashed(kind)),
        }
    }

    pub fn connect(&self) -> Result<(), ActorError> {
        self.send(Envelope::Connect)
    }

    /// Blocks up to `timeout` for the liveness signal.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.shared.liveness.wait(timeout)
    }

    pub fn mark_crashed(&self) {
        warn!(kind = %self.kind(), "Actor marked as crashed");
        self.shared.mark_crashed();
    }

    /// Lets queued commands run again. The instance stays in the `Crashed`
    /// state; only a replacement actor reconnects.
    pub fn clear_crashed(&self) {
        self.shared.crashed.clear();
    }

    pub fn is_crashed(&self) -> bool {
        self.shared.crashed.is_set()
    }

    /// Releases the hardware link. Safe to call on a disconnected actor.
    pub fn disconnect(&self) -> Result<(), ActorError> {
        if self.shared.is_stopping() || self.state() == ConnectionState::Disconnected {
            debug!(kind = %self.kind(), "Already disconnected");
            return Ok(());
        }
        self.send(Envelope::Disconnect)
    }

    /// Drains the queue and ends the actor thread. Later submissions fail.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(kind = %self.kind(), "Stopping actor");
        // The thread may already be gone after a panic.
        let _ = self.sender.send(Envelope::Stop);
    }

    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        self.shared.terminated.wait(timeout)
    }

    pub fn health(&self, timeout: Duration) -> ActorHealth {
        if self.shared.is_stopping() {
            return ActorHealth::Stopped;
        }
        if self.shared.crashed.is_set()
            || self.shared.terminated.is_set()
            || self.state() == ConnectionState::Crashed
        {
            return ActorHealth::Dead;
        }
        if self.shared.liveness.wait(timeout) {
            ActorHealth::Alive
        } else {
            ActorHealth::Dead
        }
    }

    fn send(&self, envelope: Envelope<H>) -> Result<(), ActorError> {
        if self.shared.is_stopping() {
            return Err(ActorError::Stopped(self.kind()));
        }
        self.sender
            .send(envelope)
            .map_err(|_| ActorError::Stopped(self.kind()))
    }
}

fn run<H: Hardware>(shared: &Shared, hardware: &mut H, receiver: &Receiver<Envelope<H>>) {
    while let Ok(envelope) = receiver.recv() {
        if !hold_while_crashed(shared) {
            warn!(
                kind = %shared.kind,
                dropped = receiver.len() + 1,
                "Crashed actor stopped; discarding queued commands"
            );
            return;
        }

        match envelope {
            Envelope::Connect => connect(shared, hardware),
            Envelope::Disconnect => disconnect(shared, hardware),
            Envelope::Stop => {
                disconnect(shared, hardware);
                return;
            }
            Envelope::Run(job) => {
                match panic::catch_unwind(AssertUnwindSafe(|| job(&mut *hardware))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(kind = %shared.kind, error = %e, "Device command failed"),
                    Err(_) => {
                        error!(kind = %shared.kind, "Device command panicked; actor crashed");
                        shared.mark_crashed();
                        return;
                    }
                }
            }
        }
    }
}

/// Blocks while the crash flag is set. Returns false if the actor was
/// stopped in the meantime.
fn hold_while_crashed(shared: &Shared) -> bool {
    while shared.crashed.is_set() {
        if shared.is_stopping() {
            return false;
        }
        shared.crashed.wait_clear(CRASH_HOLD_POLL);
    }
    true
}

fn connect<H: Hardware>(shared: &Shared, hardware: &mut H) {
    shared.set_state(ConnectionState::Connecting);
    match hardware.connect() {
        Ok(()) => {
            shared.set_state(ConnectionState::Connected);
            shared.liveness.set();
            info!(kind = %shared.kind, "Connected");
        }
        Err(e) => {
            shared.set_state(ConnectionState::Disconnected);
            warn!(kind = %shared.kind, error = %e, "Connection failed");
        }
    }
}

fn disconnect<H: Hardware>(shared: &Shared, hardware: &mut H) {
    if shared.state() != ConnectionState::Connected {
        debug!(kind = %shared.kind, state = ?shared.state(), "Disconnect skipped");
        return;
    }
    shared.liveness.clear();
    if let Err(e) = hardware.disconnect() {
        warn!(kind = %shared.kind, error = %e, "Disconnect reported an error");
    }
    shared.set_state(ConnectionState::Disconnected);
    info!(kind = %shared.kind, "Disconnected");
}

/// Type-erased control surface used by the watchdog and restart logic.
pub trait DeviceControl: Send + Sync {
    fn kind(&self) -> DeviceKind;
    fn state(&self) -> ConnectionState;
    fn health(&self, timeout: Duration) -> ActorHealth;
    fn is_alive(&self, timeout: Duration) -> bool;
    fn mark_crashed(&self);
    fn clear_crashed(&self);
    fn disconnect(&self) -> Result<(), ActorError>;
    fn stop(&self);
    fn wait_terminated(&self, timeout: Duration) -> bool;
}

impl<H: Hardware + 'static> DeviceControl for DeviceActor<H> {
    fn kind(&self) -> DeviceKind {
        DeviceActor::kind(self)
    }

    fn state(&self) -> ConnectionState {
        DeviceActor::state(self)
    }

    fn health(&self, timeout: Duration) -> ActorHealth {
        DeviceActor::health(self, timeout)
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        DeviceActor::is_alive(self, timeout)
    }

    fn mark_crashed(&self) {
        DeviceActor::mark_crashed(self);
    }

    fn clear_crashed(&self) {
        DeviceActor::clear_crashed(self);
    }

    fn disconnect(&self) -> Result<(), ActorError> {
        DeviceActor::disconnect(self)
    }

    fn stop(&self) {
        DeviceActor::stop(self);
    }

    fn wait_terminated(&self, timeout: Duration) -> bool {
        DeviceActor::wait_terminated(self, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        fail_connect: bool,
    }

    impl Hardware for Flaky {
        fn connect(&mut self) -> Result<(), DeviceError> {
            if self.fail_connect {
                Err(DeviceError::CommandFailed("no link".into()))
            } else {
                Ok(())
            }
        }

        fn disconnect(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_connect_leaves_liveness_unset() {
        let actor = DeviceActor::start(DeviceKind::Dome, || Flaky { fail_connect: true }).unwrap();
        assert!(!actor.is_alive(Duration::from_millis(100)));
        assert_eq!(actor.state(), ConnectionState::Disconnected);
        assert_eq!(actor.health(Duration::from_millis(10)), ActorHealth::Dead);
        actor.stop();
    }

    #[test]
    fn test_request_returns_device_error() {
        let actor = DeviceActor::start(DeviceKind::Dome, || Flaky { fail_connect: false }).unwrap();
        let result: Result<u8, _> = actor.request(
            |_| Err(DeviceError::Unsupported),
            Duration::from_secs(1),
        );
        assert_eq!(
            result,
            Err(ActorError::Device {
                kind: DeviceKind::Dome,
                source: DeviceError::Unsupported
            })
        );
        actor.stop();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let actor = DeviceActor::start(DeviceKind::Dome, || Flaky { fail_connect: false }).unwrap();
        assert!(actor.is_alive(Duration::from_secs(1)));
        assert!(actor.disconnect().is_ok());
        let _ = actor.request(|_| Ok(()), Duration::from_secs(1));
        assert_eq!(actor.state(), ConnectionState::Disconnected);
        assert!(actor.disconnect().is_ok());
        actor.stop();
        assert!(actor.wait_terminated(Duration::from_secs(1)));
    }
}
