//! Interrupts procedures that run too long or sit in a deadlock.

use super::registry::{ProcedureHandle, ProcedureRegistry};
use crate::lock::LockPool;
use crate::signal::{Signal, Wake};
use crate::types::OwnerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Timeouts the watchdog enforces.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) procedure_timeout: Duration,
    pub(crate) deadlock_timeout: Duration,
}

/// Checks every running procedure once.
///
/// A procedure running longer than `procedure_timeout` is interrupted.
/// One running longer than `deadlock_timeout` is interrupted if it waits on
/// a lock whose holder chain leads back to itself. Returns the number of
/// procedures interrupted.
pub(crate) fn scan(registry: &ProcedureRegistry, pool: &LockPool, limits: Limits) -> usize {
    let running = registry.snapshot();
    let by_owner: HashMap<OwnerId, &ProcedureHandle> =
        running.iter().map(|h| (h.owner(), &**h)).collect();

    let mut interrupted = 0;
    for handle in &running {
        if handle.is_uninterruptible() || handle.is_interrupted() {
            continue;
        }
        let elapsed = handle.elapsed();
        let reason = if elapsed > limits.procedure_timeout {
            "timeout"
        } else if elapsed > limits.deadlock_timeout && in_deadlock(handle, &by_owner, pool) {
            "deadlock"
        } else {
            continue;
        };

        if handle.interrupt() {
            error!(
                procedure = handle.name(),
                owner = %handle.owner(),
                elapsed_ms = elapsed.as_millis() as u64,
                reason,
                "procedure interrupted"
            );
            if let Some(slot) = handle.waiting_on() {
                pool.wake_slot(slot);
            }
            interrupted += 1;
        }
    }
    interrupted
}

/// Follows waits-for edges from `start` and reports whether they cycle
/// back to it. A chain through an already interrupted procedure is about
/// to break and does not count.
fn in_deadlock(
    start: &ProcedureHandle,
    by_owner: &HashMap<OwnerId, &ProcedureHandle>,
    pool: &LockPool,
) -> bool {
    let mut visited = HashSet::new();
    let mut current = start;
    loop {
        let Some(slot) = current.waiting_on() else {
            return false;
        };
        let Some(holder) = pool.slot_owner(slot) else {
            return false;
        };
        if holder == start.owner() {
            return true;
        }
        if !visited.insert(holder) {
            return false;
        }
        match by_owner.get(&holder) {
            Some(next) if !next.is_interrupted() => current = *next,
            _ => return false,
        }
    }
}

/// Background thread running [`scan`] on an interval.
pub(crate) struct Watchdog {
    signal: Arc<Signal>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn<F>(interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let s = Arc::clone(&signal);
        let thread = std::thread::Builder::new()
            .name("tabula-watchdog".to_string())
            .spawn(move || loop {
                match s.wait(interval) {
                    Wake::Stop => return,
                    Wake::Trigger | Wake::Timeout => tick(),
                }
            })?;
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::Context;
    use crate::types::LockId;
    use std::thread;

    const NO_TIMEOUT: Limits = Limits {
        procedure_timeout: Duration::from_secs(3600),
        deadlock_timeout: Duration::ZERO,
    };

    #[test]
    fn timeout_interrupts_long_runner() {
        let registry = ProcedureRegistry::default();
        let pool = LockPool::new(16);
        let reg = registry.register("slow", None);
        let limits = Limits {
            procedure_timeout: Duration::ZERO,
            deadlock_timeout: Duration::ZERO,
        };
        thread::sleep(Duration::from_millis(2));
        assert_eq!(scan(&registry, &pool, limits), 1);
        assert!(reg.handle().is_interrupted());
        assert_eq!(scan(&registry, &pool, limits), 0);
    }

    #[test]
    fn uninterruptible_is_skipped() {
        let registry = ProcedureRegistry::default();
        let pool = LockPool::new(16);
        let reg = registry.register("slow", None);
        reg.handle().set_uninterruptible();
        let limits = Limits {
            procedure_timeout: Duration::ZERO,
            deadlock_timeout: Duration::ZERO,
        };
        thread::sleep(Duration::from_millis(2));
        assert_eq!(scan(&registry, &pool, limits), 0);
    }

    #[test]
    fn waiting_without_cycle_is_not_a_deadlock() {
        let registry = ProcedureRegistry::default();
        let pool = LockPool::new(16);
        let a = registry.register("a", None);
        let b = registry.register("b", None);

        let mut ctx = Context::new(&pool, a.handle(), 16);
        ctx.lock(LockId(1)).unwrap();
        b.handle().set_waiting(pool.slot_index(LockId(1)));

        thread::sleep(Duration::from_millis(2));
        assert_eq!(scan(&registry, &pool, NO_TIMEOUT), 0);
    }

    #[test]
    fn cycle_is_broken_once() {
        let registry = ProcedureRegistry::default();
        let pool = LockPool::new(16);

        let a = registry.register("a", None);
        let b = registry.register("b", None);
        let (a_owner, b_owner) = (a.handle().owner(), b.handle().owner());
        pool.acquire(LockId(1), a_owner);
        pool.acquire(LockId(2), b_owner);
        a.handle().set_waiting(pool.slot_index(LockId(2)));
        b.handle().set_waiting(pool.slot_index(LockId(1)));

        thread::sleep(Duration::from_millis(2));
        assert_eq!(scan(&registry, &pool, NO_TIMEOUT), 1);
        assert!(a.handle().is_interrupted() != b.handle().is_interrupted());
    }

    #[test]
    fn thread_stops_promptly() {
        let mut watchdog = Watchdog::spawn(Duration::from_secs(60), || {}).unwrap();
        watchdog.stop();
        assert!(watchdog.thread.is_none());
    }
}
