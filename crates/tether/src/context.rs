// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use tick::Clock;

use crate::identity::WorkloadId;

/// Per-call context passed explicitly through every layer.
///
/// Carries the calling workload, the logical task the call belongs to and an
/// optional deadline. Channels propagate the first two as request headers and clamp
/// their timeout to the deadline.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tether::{CallContext, WorkloadId};
/// use tick::Clock;
///
/// # fn example(clock: &Clock) -> Result<(), tether::Error> {
/// let ctx = CallContext::new()
///     .with_caller(WorkloadId::parse("spiffe://example.org/planner")?)
///     .with_task_id("task-42")
///     .with_timeout(clock, Duration::from_secs(5));
///
/// assert_eq!(ctx.task_id(), Some("task-42"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    caller: Option<WorkloadId>,
    task_id: Option<String>,
    deadline: Option<Instant>,
}

impl CallContext {
    /// An empty context without caller, task or deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity of the calling workload.
    #[must_use]
    pub fn with_caller(mut self, caller: WorkloadId) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Sets the logical task identifier.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets an absolute deadline, measured on the clock used by the channel.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    ///
    /// A timeout too large to be represented leaves the context without a deadline.
    #[must_use]
    pub fn with_timeout(mut self, clock: &Clock, timeout: Duration) -> Self {
        self.deadline = clock.instant().checked_add(timeout);
        self
    }

    /// The calling workload.
    #[must_use]
    pub fn caller(&self) -> Option<&WorkloadId> {
        self.caller.as_ref()
    }

    /// The logical task identifier.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// The absolute deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` if the context has no deadline.
    ///
    /// Returns [`Duration::ZERO`] once the deadline has passed.
    #[must_use]
    pub fn remaining(&self, clock: &Clock) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(clock.instant()))
    }
}

#[cfg(test)]
mod tests {
    use tick::ClockControl;

    use super::*;

    #[test]
    fn empty_context_has_no_deadline() {
        let ctx = CallContext::new();

        assert_eq!(ctx.caller(), None);
        assert_eq!(ctx.task_id(), None);
        assert_eq!(ctx.remaining(&Clock::new_frozen()), None);
    }

    #[test]
    fn remaining_counts_down_to_zero() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let ctx = CallContext::new().with_timeout(&clock, Duration::from_secs(10));

        assert_eq!(ctx.remaining(&clock), Some(Duration::from_secs(10)));

        control.advance(Duration::from_secs(4));
        assert_eq!(ctx.remaining(&clock), Some(Duration::from_secs(6)));

        control.advance(Duration::from_secs(60));
        assert_eq!(ctx.remaining(&clock), Some(Duration::ZERO));
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let clock = Clock::new_frozen();
        let ctx = CallContext::new().with_timeout(&clock, Duration::MAX);

        assert_eq!(ctx.remaining(&clock), None);
    }

    #[test]
    fn carries_caller_and_task() {
        let caller = WorkloadId::parse("spiffe://example.org/planner").unwrap();
        let ctx = CallContext::new().with_caller(caller.clone()).with_task_id("t-1");

        assert_eq!(ctx.caller(), Some(&caller));
        assert_eq!(ctx.task_id(), Some("t-1"));
    }
}
