//! Wake-up signal for background threads.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Why [`Signal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Stop,
    Trigger,
    Timeout,
}

#[derive(Debug, Default)]
struct SignalState {
    stopped: bool,
    triggered: bool,
}

/// Lets a background loop sleep until a timeout, a trigger or a stop.
///
/// Triggers are sticky: one raised while the loop is busy is seen by the
/// next wait.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.stopped && !state.triggered {
            self.cond.wait_for(&mut state, timeout);
        }
        if state.stopped {
            Wake::Stop
        } else if std::mem::take(&mut state.triggered) {
            Wake::Trigger
        } else {
            Wake::Timeout
        }
    }

    pub(crate) fn trigger(&self) {
        self.state.lock().triggered = true;
        self.cond.notify_all();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out() {
        let signal = Signal::default();
        assert_eq!(signal.wait(Duration::from_millis(5)), Wake::Timeout);
    }

    #[test]
    fn trigger_is_sticky_and_consumed() {
        let signal = Signal::default();
        signal.trigger();
        assert_eq!(signal.wait(Duration::from_secs(5)), Wake::Trigger);
        assert_eq!(signal.wait(Duration::from_millis(5)), Wake::Timeout);
    }

    #[test]
    fn stop_wakes_waiter() {
        let signal = Arc::new(Signal::default());
        let s = Arc::clone(&signal);
        let waiter = thread::spawn(move || s.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert_eq!(waiter.join().unwrap(), Wake::Stop);
        assert!(signal.is_stopped());
    }
}
