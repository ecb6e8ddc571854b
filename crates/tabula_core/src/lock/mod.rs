//! Record locking.

mod pool;

pub use pool::{LockGuard, LockPool};
