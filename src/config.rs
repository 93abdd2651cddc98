//! Scheduler configuration.

use crate::record::WakePreference;

/// Configuration for a [`Scheduler`](crate::Scheduler) instance.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Default wake policy for channels created without an explicit one.
    pub preference: WakePreference,
    /// Upper bound on dispatches per [`Scheduler::run`](crate::Scheduler::run)
    /// call. `None` disables the guard.
    pub max_steps: Option<u64>,
}

impl SchedulerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            preference: WakePreference::Queued,
            max_steps: Some(1_000_000),
        }
    }

    /// Sets the default channel wake policy.
    #[must_use]
    pub const fn preference(mut self, preference: WakePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Sets the per-`run` dispatch guard.
    #[must_use]
    pub const fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Disables the per-`run` dispatch guard.
    #[must_use]
    pub const fn no_step_limit(mut self) -> Self {
        self.max_steps = None;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
