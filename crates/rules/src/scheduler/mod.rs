//! Late loading of rule files that are not present at boot.
//!
//! Partitions holding rule files may be mounted well after the engine
//! starts. [`LateLoadScheduler`] keeps retrying the candidates whose class is
//! still missing on a dedicated thread, and gives up for good by setting
//! `TIMEOUT` once its wall-clock budget runs out.

mod core;
mod signal;


pub use self::core::{ExitReason, LateLoadScheduler, Pass};
pub use self::signal::ShutdownSignal;
