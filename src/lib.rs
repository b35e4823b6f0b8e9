pub mod config;
pub mod error;
pub mod infra;
pub mod model;
pub mod policy;
pub mod ports;
pub mod registry;
pub mod service;
pub mod termination;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use registry::LiveJobs;
pub use service::{JobRemoveHandler, SchedulerStatus, SchedulingService};
pub use termination::TerminationData;
