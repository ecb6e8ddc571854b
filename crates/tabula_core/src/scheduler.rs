//! Worker pool with per-session ordering.
//!
//! Plain jobs run in FIFO order on a fixed set of worker threads. Jobs
//! submitted under a [`SessionId`] additionally run one at a time, in
//! submission order: each session has its own queue, drained by a single
//! runner job that yields its worker after a batch and re-submits itself.

use crate::error::{panic_message, CoreError, CoreResult};
use crate::types::SessionId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Jobs currently running.
    pub active: usize,
    /// Jobs finished since start.
    pub completed: u64,
    /// Sessions with pending or running work.
    pub sessions: usize,
    /// Session jobs dropped by overflow or [`Scheduler::stop_session`].
    pub dropped: u64,
    /// Worker threads.
    pub workers: usize,
}

#[derive(Default)]
struct SessionQueue {
    pending: VecDeque<Job>,
}

struct SchedulerInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    closed: AtomicBool,
    stopping: AtomicBool,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    dropped: AtomicU64,
    // A session is present exactly while a runner job for it is queued or running.
    sessions: Mutex<HashMap<SessionId, SessionQueue>>,
    max_session: usize,
    max_batch: usize,
}

impl SchedulerInner {
    fn enqueue(&self, job: Job) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(job);
            self.queued.fetch_add(1, Ordering::Release);
        }
        self.work_ready.notify_one();
    }
}

/// Fixed pool of procedure workers.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl Scheduler {
    /// Starts `threads` workers named `tabula-proc-N`.
    ///
    /// # Errors
    ///
    /// [`CoreError::Io`] if a thread cannot be spawned.
    pub fn new(threads: usize, max_session: usize, max_batch: usize) -> CoreResult<Self> {
        let threads = threads.max(1);
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            closed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            max_session: max_session.max(1),
            max_batch: max_batch.max(1),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("tabula-proc-{i}"))
                .spawn(move || worker_loop(&inner))?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            threads,
        })
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseClosed`] once the scheduler stopped accepting work.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> CoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::DatabaseClosed);
        }
        self.inner.enqueue(Box::new(job));
        Ok(())
    }

    /// Queues a job behind every earlier job of the same session.
    ///
    /// If the session already has the maximum number of pending jobs, the
    /// whole pending queue is dropped together with `job`.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionOverflow`] when the queue was dropped,
    /// [`CoreError::DatabaseClosed`] once the scheduler stopped accepting work.
    pub fn submit_session(&self, session: SessionId, job: impl FnOnce() + Send + 'static) -> CoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::DatabaseClosed);
        }

        let start_runner = {
            let mut sessions = self.inner.sessions.lock();
            let start_runner = !sessions.contains_key(&session);
            let queue = sessions.entry(session).or_default();
            if queue.pending.len() >= self.inner.max_session {
                let dropped = queue.pending.len() + 1;
                queue.pending.clear();
                self.inner.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                error!(session = %session, dropped, "session queue overflow; pending procedures dropped");
                return Err(CoreError::SessionOverflow { session, dropped });
            }
            queue.pending.push_back(Box::new(job));
            start_runner
        };

        if start_runner {
            self.spawn_runner(session);
        }
        Ok(())
    }

    fn spawn_runner(&self, session: SessionId) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .enqueue(Box::new(move || run_session(inner, session)));
    }

    /// Drops every pending job of a session. A job already running finishes.
    ///
    /// Returns the number of jobs dropped.
    pub fn stop_session(&self, session: SessionId) -> usize {
        let dropped = self
            .inner
            .sessions
            .lock()
            .get_mut(&session)
            .map_or(0, |queue| std::mem::take(&mut queue.pending).len());
        if dropped > 0 {
            self.inner.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(session = %session, dropped, "session stopped");
        }
        dropped
    }

    /// Pending jobs of a session.
    #[must_use]
    pub fn session_pending(&self, session: SessionId) -> usize {
        self.inner
            .sessions
            .lock()
            .get(&session)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Stops accepting new jobs. Queued jobs still run.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once [`Scheduler::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Blocks until no job is queued or running, or `timeout` passes.
    ///
    /// Returns `true` if the scheduler drained.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        while self.inner.queued.load(Ordering::Acquire) > 0
            || self.inner.active.load(Ordering::Acquire) > 0
        {
            if self.inner.drain_cond.wait_until(&mut queue, deadline).timed_out() {
                return self.inner.queued.load(Ordering::Acquire) == 0
                    && self.inner.active.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Stops the workers.
    ///
    /// Jobs still queued are dropped. Workers are joined only when
    /// `join` is set; a worker stuck in a job is otherwise left behind.
    pub fn shutdown(&self, join: bool) {
        self.close();
        self.inner.stopping.store(true, Ordering::Release);
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let dropped = queue.len();
            queue.clear();
            self.inner.queued.store(0, Ordering::Release);
            self.inner.work_ready.notify_all();
            dropped
        };
        self.inner.sessions.lock().clear();
        if dropped > 0 {
            warn!(dropped, "scheduler stopped with queued jobs");
        }

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if join {
            for handle in workers {
                if handle.join().is_err() {
                    error!("procedure worker panicked");
                }
            }
        } else if !workers.is_empty() {
            warn!(workers = workers.len(), "detaching busy procedure workers");
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            sessions: self.inner.sessions.lock().len(),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            workers: self.threads,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.inner.stopping.load(Ordering::Acquire) {
            self.shutdown(true);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("stats", &self.stats()).finish()
    }
}

/// Runs up to one batch of a session's jobs, then yields.
fn run_session(inner: Arc<SchedulerInner>, session: SessionId) {
    for _ in 0..inner.max_batch {
        let job = {
            let mut sessions = inner.sessions.lock();
            let Some(queue) = sessions.get_mut(&session) else {
                return;
            };
            match queue.pending.pop_front() {
                Some(job) => job,
                None => {
                    sessions.remove(&session);
                    return;
                }
            }
        };
        run_job(job);
    }

    {
        let mut sessions = inner.sessions.lock();
        match sessions.get(&session) {
            Some(queue) if !queue.pending.is_empty() => {}
            Some(_) => {
                sessions.remove(&session);
                return;
            }
            None => return,
        }
    }
    if inner.stopping.load(Ordering::Acquire) {
        return;
    }
    let next = Arc::clone(&inner);
    inner.enqueue(Box::new(move || run_session(next, session)));
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(payload.as_ref()), "scheduled job panicked");
    }
}

/// Decrements the active count even if a job panics.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        let previous = self.inner.active.fetch_sub(1, Ordering::AcqRel);
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if previous == 1 && self.inner.queued.load(Ordering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.queued.fetch_sub(1, Ordering::AcqRel);
                    inner.active.fetch_add(1, Ordering::AcqRel);
                    break job;
                }
                if inner.stopping.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };
        run_job(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn submit_and_drain() {
        let scheduler = Scheduler::new(2, 16, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert_eq!(scheduler.stats().completed, 10);
        scheduler.shutdown(true);
    }

    #[test]
    fn session_jobs_run_in_order_across_batches() {
        let scheduler = Scheduler::new(4, 1000, 3).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let o = Arc::clone(&order);
            scheduler
                .submit_session(SessionId(1), move || o.lock().push(i))
                .unwrap();
        }
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
        assert_eq!(scheduler.stats().sessions, 0);
    }

    #[test]
    fn sessions_do_not_overlap() {
        let scheduler = Scheduler::new(4, 1000, 2).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        for _ in 0..40 {
            let inside = Arc::clone(&inside);
            scheduler
                .submit_session(SessionId(7), move || {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(scheduler.drain(Duration::from_secs(10)));
        assert_eq!(scheduler.stats().sessions, 0);
    }

    #[test]
    fn overflow_drops_whole_queue() {
        let scheduler = Scheduler::new(1, 2, 8).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler.submit(move || {
            b.wait();
        })
        .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let r = Arc::clone(&ran);
            scheduler
                .submit_session(SessionId(3), move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let err = scheduler
            .submit_session(SessionId(3), || {})
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionOverflow { dropped: 3, .. }));
        assert_eq!(scheduler.session_pending(SessionId(3)), 0);

        barrier.wait();
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().dropped, 3);
    }

    #[test]
    fn stop_session_clears_pending() {
        let scheduler = Scheduler::new(1, 100, 8).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler.submit(move || {
            b.wait();
        })
        .unwrap();
        for _ in 0..5 {
            scheduler.submit_session(SessionId(4), || {}).unwrap();
        }
        assert_eq!(scheduler.stop_session(SessionId(4)), 5);
        barrier.wait();
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(scheduler.stats().sessions, 0);
    }

    #[test]
    fn closed_scheduler_rejects_work() {
        let scheduler = Scheduler::new(1, 4, 4).unwrap();
        scheduler.close();
        assert!(matches!(scheduler.submit(|| {}), Err(CoreError::DatabaseClosed)));
        assert!(matches!(
            scheduler.submit_session(SessionId(1), || {}),
            Err(CoreError::DatabaseClosed)
        ));
        scheduler.shutdown(true);
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let scheduler = Scheduler::new(1, 4, 4).unwrap();
        scheduler.submit(|| panic!("job failure")).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        scheduler
            .submit(move || d.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert!(done.load(Ordering::SeqCst));
    }
}
