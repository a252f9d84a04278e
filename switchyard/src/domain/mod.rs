//! Domain types: job lifecycle, locks and device targets.
//!
//! These are plain data structs. Persistence lives in [`crate::database`].

pub mod device;
pub mod job;
pub mod lock;

pub use device::{DeviceFilter, DeviceState, DeviceTarget, DeviceType};
pub use job::{JobRecord, JobStatus};
pub use lock::{Lock, LockKey};
