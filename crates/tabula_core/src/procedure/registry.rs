//! Registry of running procedures.

use crate::types::{OwnerId, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const NOT_WAITING: usize = usize::MAX;

/// Shared state of one running procedure.
///
/// The executing thread owns the procedure; the watchdog reads the start
/// time and lock wait, and may set the interrupt flag.
#[derive(Debug)]
pub(crate) struct ProcedureHandle {
    owner: OwnerId,
    name: String,
    session: Option<SessionId>,
    started: Instant,
    interrupted: AtomicBool,
    uninterruptible: AtomicBool,
    waiting_on: AtomicUsize,
}

impl ProcedureHandle {
    fn new(owner: OwnerId, name: &str, session: Option<SessionId>) -> Self {
        Self {
            owner,
            name: name.to_string(),
            session,
            started: Instant::now(),
            interrupted: AtomicBool::new(false),
            uninterruptible: AtomicBool::new(false),
            waiting_on: AtomicUsize::new(NOT_WAITING),
        }
    }

    pub(crate) fn owner(&self) -> OwnerId {
        self.owner
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn interrupt_flag(&self) -> &AtomicBool {
        &self.interrupted
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Sets the interrupt flag unless the procedure opted out.
    ///
    /// Returns `true` if the flag was newly set.
    pub(crate) fn interrupt(&self) -> bool {
        if self.uninterruptible.load(Ordering::Acquire) {
            return false;
        }
        !self.interrupted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_uninterruptible(&self) {
        self.uninterruptible.store(true, Ordering::Release);
    }

    pub(crate) fn is_uninterruptible(&self) -> bool {
        self.uninterruptible.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting(&self, slot: usize) {
        self.waiting_on.store(slot, Ordering::Release);
    }

    pub(crate) fn clear_waiting(&self) {
        self.waiting_on.store(NOT_WAITING, Ordering::Release);
    }

    /// Lock slot the procedure is blocked on, if any.
    pub(crate) fn waiting_on(&self) -> Option<usize> {
        match self.waiting_on.load(Ordering::Acquire) {
            NOT_WAITING => None,
            slot => Some(slot),
        }
    }
}

/// Public view of a running procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcedure {
    /// Procedure name.
    pub name: String,
    /// Lock owner id of this run.
    pub owner: OwnerId,
    /// Session the procedure was scheduled on.
    pub session: Option<SessionId>,
    /// Time since the procedure started.
    pub elapsed: Duration,
    /// Whether the watchdog interrupted it.
    pub interrupted: bool,
}

/// All procedures currently executing.
#[derive(Debug)]
pub(crate) struct ProcedureRegistry {
    next_owner: AtomicU64,
    running: Mutex<HashMap<OwnerId, Arc<ProcedureHandle>>>,
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self {
            next_owner: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
        }
    }
}

impl ProcedureRegistry {
    /// Registers a procedure run; it stays registered until the returned
    /// registration is dropped.
    pub(crate) fn register(&self, name: &str, session: Option<SessionId>) -> Registration<'_> {
        let owner = OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ProcedureHandle::new(owner, name, session));
        self.running.lock().insert(owner, Arc::clone(&handle));
        Registration {
            registry: self,
            handle,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ProcedureHandle>> {
        self.running.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub(crate) fn describe(&self) -> Vec<RunningProcedure> {
        let mut list: Vec<_> = self
            .snapshot()
            .iter()
            .map(|h| RunningProcedure {
                name: h.name().to_string(),
                owner: h.owner(),
                session: h.session(),
                elapsed: h.elapsed(),
                interrupted: h.is_interrupted(),
            })
            .collect();
        list.sort_by_key(|p| p.owner);
        list
    }
}

/// Keeps a procedure registered while it runs.
pub(crate) struct Registration<'a> {
    registry: &'a ProcedureRegistry,
    handle: Arc<ProcedureHandle>,
}

impl Registration<'_> {
    pub(crate) fn handle(&self) -> &ProcedureHandle {
        &self.handle
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.running.lock().remove(&self.handle.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_scoped() {
        let registry = ProcedureRegistry::default();
        {
            let a = registry.register("a", None);
            let b = registry.register("b", Some(SessionId(3)));
            assert_ne!(a.handle().owner(), b.handle().owner());
            assert_eq!(registry.len(), 2);

            let described = registry.describe();
            assert_eq!(described[0].name, "a");
            assert_eq!(described[1].session, Some(SessionId(3)));
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn uninterruptible_handle_ignores_interrupt() {
        let registry = ProcedureRegistry::default();
        let reg = registry.register("p", None);
        let handle = reg.handle();
        handle.set_uninterruptible();
        assert!(!handle.interrupt());
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn interrupt_is_reported_once() {
        let registry = ProcedureRegistry::default();
        let reg = registry.register("p", None);
        assert!(reg.handle().interrupt());
        assert!(!reg.handle().interrupt());
        assert!(reg.handle().is_interrupted());
    }

    #[test]
    fn waiting_slot_round_trip() {
        let registry = ProcedureRegistry::default();
        let reg = registry.register("p", None);
        assert_eq!(reg.handle().waiting_on(), None);
        reg.handle().set_waiting(12);
        assert_eq!(reg.handle().waiting_on(), Some(12));
        reg.handle().clear_waiting();
        assert_eq!(reg.handle().waiting_on(), None);
    }
}
