//! Database models for switchyard.
//!
//! These models map directly to the database schema. Conversion into domain
//! types parses the JSON columns and the status name.

pub mod job;
pub mod lock;
pub mod schedule;

pub use job::*;
pub use lock::*;
pub use schedule::*;
