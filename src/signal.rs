use crossbeam_channel::{bounded, Sender};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Actor jobs run under `catch_unwind`, so a poisoned lock only means a
/// driver misbehaved; the protected data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SignalState {
    flag: bool,
    /// One wake-up slot per blocked waiter, drained on every change.
    waiters: Vec<(u64, Sender<()>)>,
    next_waiter: u64,
}

/// A boolean condition with set/clear/wait-with-timeout semantics.
///
/// Used for liveness, crash, completion and shutdown flags shared between
/// the scheduler, the watchdog and device actor threads. Waiters park on a
/// single-slot channel that the next `set` or `clear` wakes.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<SignalState>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that starts out set (e.g. "no slew in progress").
    pub fn new_set() -> Self {
        Self {
            state: Mutex::new(SignalState {
                flag: true,
                ..SignalState::default()
            }),
        }
    }

    pub fn set(&self) {
        self.store(true);
    }

    pub fn clear(&self) {
        self.store(false);
    }

    pub fn is_set(&self) -> bool {
        lock(&self.state).flag
    }

    /// Blocks up to `timeout` for the signal to be set. Returns whether it is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wait_for(true, timeout)
    }

    /// Blocks up to `timeout` for the signal to be cleared. Returns whether it is clear.
    pub fn wait_clear(&self, timeout: Duration) -> bool {
        self.wait_for(false, timeout)
    }

    /// Non-blocking check in the `nb` style, so callers can interleave other
    /// work (tracking adjustments) with a completion wait.
    pub fn poll(&self) -> nb::Result<(), Infallible> {
        if self.is_set() {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn store(&self, flag: bool) {
        let mut state = lock(&self.state);
        state.flag = flag;
        for (_, waiter) in state.waiters.drain(..) {
            // A full slot or a departed waiter needs no second wake-up.
            let _ = waiter.try_send(());
        }
    }

    fn wait_for(&self, target: bool, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let (id, wake) = {
                let mut state = lock(&self.state);
                if state.flag == target {
                    return true;
                }
                let id = state.next_waiter;
                state.next_waiter = state.next_waiter.wrapping_add(1);
                let (sender, receiver) = bounded(1);
                state.waiters.push((id, sender));
                (id, receiver)
            };
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() || wake.recv_timeout(remaining).is_err() {
                let mut state = lock(&self.state);
                state.waiters.retain(|(waiter, _)| *waiter != id);
                return state.flag == target;
            }
        }
    }
}

/// Cloneable handle to the global "shutdown requested" signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<Signal>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.set();
    }

    pub fn is_requested(&self) -> bool {
        self.0.is_set()
    }

    /// Waits up to `timeout` for a shutdown request. Returns true if one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.0.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_unset() {
        let signal = Signal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_set_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let setter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        assert!(signal.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_clear_wakes_waiter_and_timeouts_leave_no_waiters() {
        let signal = Arc::new(Signal::new_set());
        assert!(!signal.wait_clear(Duration::from_millis(5)));
        assert!(lock(&signal.state).waiters.is_empty());

        let clearer = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            clearer.clear();
        });
        assert!(signal.wait_clear(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(lock(&signal.state).waiters.is_empty());
    }

    #[test]
    fn test_poll_and_wait_clear() {
        let signal = Signal::new_set();
        assert!(signal.poll().is_ok());
        signal.clear();
        assert!(matches!(signal.poll(), Err(nb::Error::WouldBlock)));
        assert!(signal.wait_clear(Duration::from_millis(1)));
    }

    #[test]
    fn test_shutdown_handle_is_shared() {
        let handle = ShutdownHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_requested());
        clone.request();
        assert!(handle.is_requested());
        assert!(handle.wait(Duration::from_millis(1)));
    }
}
