//! CLI command implementations.

pub mod backup;
pub mod bench;
pub mod inspect;
