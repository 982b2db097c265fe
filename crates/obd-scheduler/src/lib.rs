//! OBD-II Monitoring Scheduler
//!
//! Drives a recurring poll cycle over a caller-selected parameter list and
//! publishes each decoded sample to every current subscriber.

mod error;
mod scheduler;

pub use error::MonitorError;
pub use scheduler::{MonitoringScheduler, SchedulerConfig, SessionHandle};
