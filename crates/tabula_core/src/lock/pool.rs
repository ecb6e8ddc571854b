//! Fixed-size pool of reentrant record locks.

use crate::types::{LockId, OwnerId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Upper bound on how long a blocked acquire sleeps before rechecking its
/// interrupt flag.
const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct SlotState {
    owner: Option<OwnerId>,
    depth: u32,
}

#[derive(Debug, Default)]
struct LockSlot {
    state: Mutex<SlotState>,
    released: Condvar,
}

/// A fixed array of lock slots shared by every table.
///
/// A [`LockId`] selects slot `id & mask`. Slots are created on first use.
/// Locks are reentrant per [`OwnerId`]: an owner may acquire a slot it
/// already holds, and must release it the same number of times.
///
/// The pool enforces no ordering; callers that take several slots must take
/// them in ascending slot order to stay deadlock-free.
#[derive(Debug)]
pub struct LockPool {
    slots: Box<[OnceLock<LockSlot>]>,
    mask: u32,
}

impl LockPool {
    /// Creates a pool with `size` slots, rounded up to a power of two.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, 1 << 30).next_power_of_two();
        Self {
            slots: (0..size).map(|_| OnceLock::new()).collect(),
            mask: (size - 1) as u32,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`; a pool has at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index a lock id maps to.
    #[must_use]
    pub fn slot_index(&self, id: LockId) -> usize {
        (id.0 & self.mask) as usize
    }

    fn slot(&self, index: usize) -> &LockSlot {
        self.slots[index].get_or_init(LockSlot::default)
    }

    /// Blocks until `owner` holds the lock.
    pub fn acquire(&self, id: LockId, owner: OwnerId) {
        let never = AtomicBool::new(false);
        self.acquire_slot(self.slot_index(id), owner, &never);
    }

    /// Blocks until `owner` holds the lock or `interrupted` becomes `true`.
    ///
    /// Returns `false` if interrupted before the lock was acquired.
    pub fn acquire_interruptible(&self, id: LockId, owner: OwnerId, interrupted: &AtomicBool) -> bool {
        self.acquire_slot(self.slot_index(id), owner, interrupted)
    }

    pub(crate) fn acquire_slot(&self, index: usize, owner: OwnerId, interrupted: &AtomicBool) -> bool {
        let slot = self.slot(index);
        let mut state = slot.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(owner);
                    state.depth = 1;
                    return true;
                }
                Some(current) if current == owner => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => {}
            }
            if interrupted.load(Ordering::Acquire) {
                return false;
            }
            slot.released.wait_for(&mut state, WAIT_POLL);
        }
    }

    /// Acquires the lock only if it is free or already held by `owner`.
    ///
    /// The returned guard releases the lock when dropped.
    #[must_use]
    pub fn try_acquire(&self, id: LockId, owner: OwnerId) -> Option<LockGuard<'_>> {
        let index = self.slot_index(id);
        let mut state = self.slot(index).state.lock();
        match state.owner {
            None => {
                state.owner = Some(owner);
                state.depth = 1;
            }
            Some(current) if current == owner => state.depth += 1,
            Some(_) => return None,
        }
        Some(LockGuard {
            pool: self,
            index,
            owner,
        })
    }

    /// Releases one hold of the lock by `owner`.
    ///
    /// Returns `false` if `owner` did not hold it.
    pub fn release(&self, id: LockId, owner: OwnerId) -> bool {
        self.release_slot(self.slot_index(id), owner)
    }

    pub(crate) fn release_slot(&self, index: usize, owner: OwnerId) -> bool {
        let Some(slot) = self.slots[index].get() else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.owner != Some(owner) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            slot.released.notify_one();
        }
        true
    }

    /// Returns `true` if `owner` currently holds the lock.
    #[must_use]
    pub fn is_held_by(&self, id: LockId, owner: OwnerId) -> bool {
        self.slot_owner(self.slot_index(id)) == Some(owner)
    }

    /// Current holder of the lock, if any.
    #[must_use]
    pub fn owner_of(&self, id: LockId) -> Option<OwnerId> {
        self.slot_owner(self.slot_index(id))
    }

    pub(crate) fn slot_owner(&self, index: usize) -> Option<OwnerId> {
        self.slots[index].get().and_then(|slot| slot.state.lock().owner)
    }

    /// Wakes every waiter on a slot so they recheck their interrupt flags.
    pub(crate) fn wake_slot(&self, index: usize) {
        if let Some(slot) = self.slots[index].get() {
            let _state = slot.state.lock();
            slot.released.notify_all();
        }
    }
}

/// Holds one acquisition of a lock slot, releasing it on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    pool: &'a LockPool,
    index: usize,
    owner: OwnerId,
}

impl LockGuard<'_> {
    /// Owner the slot is held for.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.pool.release_slot(self.index, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const A: OwnerId = OwnerId(1);
    const B: OwnerId = OwnerId(2);

    #[test]
    fn pool_size_rounds_up() {
        assert_eq!(LockPool::new(1000).len(), 1024);
        assert_eq!(LockPool::new(0).len(), 1);
        let pool = LockPool::new(16);
        assert_eq!(pool.slot_index(LockId(17)), 1);
    }

    #[test]
    fn reentrant_acquire_needs_matching_releases() {
        let pool = LockPool::new(16);
        let id = LockId(3);
        pool.acquire(id, A);
        pool.acquire(id, A);
        assert!(pool.try_acquire(id, B).is_none());

        assert!(pool.release(id, A));
        assert!(pool.is_held_by(id, A));
        assert!(pool.release(id, A));
        assert_eq!(pool.owner_of(id), None);
        assert!(!pool.release(id, A));
    }

    #[test]
    fn colliding_ids_share_a_slot() {
        let pool = LockPool::new(16);
        pool.acquire(LockId(5), A);
        assert!(pool.try_acquire(LockId(5 + 16), B).is_none());
        assert!(pool.is_held_by(LockId(21), A));
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool = LockPool::new(16);
        {
            let guard = pool.try_acquire(LockId(1), OwnerId::CHECKPOINT).unwrap();
            assert_eq!(guard.owner(), OwnerId::CHECKPOINT);
            assert!(pool.try_acquire(LockId(1), A).is_none());
        }
        assert!(pool.try_acquire(LockId(1), A).is_some());
        assert_eq!(pool.owner_of(LockId(1)), None);
    }

    #[test]
    fn blocked_acquire_proceeds_after_release() {
        let pool = Arc::new(LockPool::new(16));
        pool.acquire(LockId(7), A);

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            p.acquire(LockId(7), B);
            let held = p.is_held_by(LockId(7), B);
            p.release(LockId(7), B);
            held
        });

        thread::sleep(Duration::from_millis(30));
        pool.release(LockId(7), A);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn interrupted_acquire_gives_up() {
        let pool = Arc::new(LockPool::new(16));
        pool.acquire(LockId(9), A);
        let flag = Arc::new(AtomicBool::new(false));

        let (p, f) = (Arc::clone(&pool), Arc::clone(&flag));
        let waiter = thread::spawn(move || p.acquire_interruptible(LockId(9), B, &f));

        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        pool.wake_slot(pool.slot_index(LockId(9)));
        assert!(!waiter.join().unwrap());
        assert!(pool.is_held_by(LockId(9), A));
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let pool = Arc::new(LockPool::new(4));
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4u64)
            .map(|i| {
                let (pool, inside, barrier) =
                    (Arc::clone(&pool), Arc::clone(&inside), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        pool.acquire(LockId(2), OwnerId(i + 1));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        pool.release(LockId(2), OwnerId(i + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
