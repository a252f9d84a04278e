//! Repository layer for database access.
//!
//! Each store is a trait with a `Sqlx*` implementation over a [`sqlx::SqlitePool`].
//! Callers hold `Arc<dyn ...Repository>` so tests can substitute their own.

pub mod job;
pub mod lock;
pub mod schedule;

pub use job::*;
pub use lock::*;
pub use schedule::*;
