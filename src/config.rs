use std::time::Duration;

/// Process-wide scheduling tunables.
///
/// Constructed once and handed to `SchedulingService`/`LiveJobs` at startup;
/// nothing in the core reads ambient global state.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default normal-attempt budget applied to tasks that do not set their
    /// own `max_number_of_execution`.
    pub max_number_of_execution: u32,
    /// Restart budget after a *node* failure, independent of the normal
    /// attempt budget.
    pub number_of_execution_on_failure: u32,
    /// Delay before a failed task with remaining budget is re-queued.
    pub restart_on_error_delay: Duration,
    /// Delay between drain checks while the scheduler is shutting down.
    pub shutdown_poll_delay: Duration,
    /// When set, a finalized job is removed from persistence and the
    /// registry after this delay (housekeeping).
    pub auto_remove_job_delay: Option<Duration>,
    /// Whether job removal purges persisted state or only flags it removed.
    pub remove_job_from_db: bool,
    /// Scheduling pass period of the driver loop.
    pub scheduling_interval: Duration,
    /// Liveness probe period of the pinger loop.
    pub ping_interval: Duration,
    /// Concurrency bound of the internal-operations pool.
    pub internal_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_number_of_execution: 1,
            number_of_execution_on_failure: 5,
            restart_on_error_delay: Duration::ZERO,
            shutdown_poll_delay: Duration::from_secs(5),
            auto_remove_job_delay: None,
            remove_job_from_db: true,
            scheduling_interval: Duration::from_millis(100),
            ping_interval: Duration::from_secs(20),
            internal_pool_size: 8,
        }
    }
}
