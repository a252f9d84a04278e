//! switchyard library crate.
//!
//! Job orchestration for switch fleet operations: named job locks, the job
//! lifecycle, scheduling, and fan-out of operations across devices.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod logging;
pub mod operations;
pub mod scheduler;

pub use error::{Error, Result};
