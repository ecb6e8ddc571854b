//! # Tabula Testkit
//!
//! Test utilities for Tabula.
//!
//! This crate provides:
//! - Test fixtures: databases over memory or file storage, an account model
//! - [`FaultyStorage`], a storage wrapper with switchable faults
//! - Property-based generators for lock sets and table workloads
//! - Stress helpers that drive concurrent procedures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabula_testkit::prelude::*;
//!
//! #[test]
//! fn transfers_keep_money() {
//!     let db = memory_db();
//!     let accounts = scenarios::accounts(&db);
//!     scenarios::seed_accounts(&db, &accounts, 16, 100);
//!     stress_transfers(&db, &accounts, &StressConfig::default());
//!     assert_eq!(scenarios::total_balance(&accounts, 16), 1_600);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
