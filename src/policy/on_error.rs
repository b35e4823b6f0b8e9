use crate::model::OnTaskError;

/// Pure interpretation of a task's effective on-error policy. The unset and
/// continue policies answer false everywhere, which selects the default
/// retry-then-continue path in the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnErrorPolicyInterpreter;

impl OnErrorPolicyInterpreter {
    pub fn requires_pause_task_on_error(&self, policy: OnTaskError) -> bool {
        matches!(policy, OnTaskError::PauseTask)
    }

    pub fn requires_pause_job_on_error(&self, policy: OnTaskError) -> bool {
        matches!(policy, OnTaskError::PauseJob)
    }

    pub fn requires_cancel_job_on_error(&self, policy: OnTaskError) -> bool {
        matches!(policy, OnTaskError::CancelJob)
    }
}
