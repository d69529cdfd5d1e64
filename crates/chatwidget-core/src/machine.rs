//! Initialization lifecycle and the whole-sequence retry loop.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use crate::error::WidgetError;
use crate::host::HostFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    LocatingMount,
    Authenticating,
    CreatingFrame,
    AwaitingReady,
    Ready,
    Failed,
    Destroyed,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::LocatingMount => "locating_mount",
            Self::Authenticating => "authenticating",
            Self::CreatingFrame => "creating_frame",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Destroyed)
    }

    fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::LocatingMount | Self::Authenticating | Self::CreatingFrame | Self::AwaitingReady
        )
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Destroyed, _) => false,
            (_, Self::Destroyed) => true,
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            (Self::Created, Self::LocatingMount) => true,
            // A retry restarts the sequence from the first step.
            (current, Self::LocatingMount) => current.is_in_flight(),
            (Self::LocatingMount, Self::Authenticating | Self::CreatingFrame) => true,
            (Self::Authenticating, Self::CreatingFrame) => true,
            (Self::CreatingFrame, Self::AwaitingReady) => true,
            (Self::AwaitingReady, Self::Ready) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the failed-attempt counter.
#[derive(Debug)]
pub struct Lifecycle {
    state: Cell<LifecycleState>,
    attempts: Cell<u32>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Cell::new(LifecycleState::Created),
            attempts: Cell::new(0),
        }
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> LifecycleState {
        self.state.get()
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.get()
    }

    /// Moves to `next` if the edge is legal. Illegal edges are refused and leave the state alone.
    pub fn advance(&self, next: LifecycleState) -> bool {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "Refusing lifecycle transition");
            return false;
        }
        tracing::debug!(from = %current, to = %next, "Widget lifecycle transition");
        self.state.set(next);
        true
    }

    fn record_failure(&self) -> u32 {
        let attempts = self.attempts.get().saturating_add(1);
        self.attempts.set(attempts);
        attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// One widget's init steps, as seen by [`drive`].
pub trait InitSequence {
    fn lifecycle(&self) -> &Lifecycle;
    /// Timer used for the delay between attempts.
    fn sleep(&self, duration: Duration) -> HostFuture<()>;
    fn retry_policy(&self) -> RetryPolicy;
    /// Runs every step from mount location to the ready signal.
    fn attempt(&self) -> impl Future<Output = Result<(), WidgetError>>;
    /// Releases whatever a failed attempt left behind (frame, pending ready waiter).
    fn discard_attempt(&self);
    /// Called once after the transition to `Ready`.
    fn complete(&self);
    /// Called once after the transition to `Failed`.
    fn fail(&self, error: &WidgetError);
}

/// Runs attempts until one succeeds, retries are exhausted, or the widget is destroyed.
///
/// Every retry restarts from mount location after a fixed delay. Terminal handling runs at most
/// once because it is gated on the single `Failed` transition.
pub async fn drive<S: InitSequence>(sequence: &S) {
    let lifecycle = sequence.lifecycle();
    loop {
        if !lifecycle.advance(LifecycleState::LocatingMount) {
            return;
        }
        let error = match sequence.attempt().await {
            Ok(()) => {
                if lifecycle.advance(LifecycleState::Ready) {
                    tracing::info!(attempts = lifecycle.attempts() + 1, "Chat widget is ready");
                    sequence.complete();
                }
                return;
            }
            Err(error) => error,
        };

        sequence.discard_attempt();
        if lifecycle.current() == LifecycleState::Destroyed {
            return;
        }
        let attempts = lifecycle.record_failure();
        let policy = sequence.retry_policy();
        if attempts < policy.max_attempts {
            tracing::warn!(
                attempt = attempts,
                max_attempts = policy.max_attempts,
                code = %error.code,
                error = %error.message,
                "Widget initialization attempt failed, retrying"
            );
            sequence.sleep(policy.delay).await;
            continue;
        }

        if lifecycle.advance(LifecycleState::Failed) {
            tracing::error!(
                attempts,
                code = %error.code,
                error = %error.message,
                "Widget initialization failed"
            );
            sequence.fail(&error);
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use crate::host::Scheduler;
    use crate::test_host::FakeHost;

    #[test]
    fn happy_path_edges_are_legal() {
        use LifecycleState::*;
        let path = [
            Created,
            LocatingMount,
            Authenticating,
            CreatingFrame,
            AwaitingReady,
            Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(LocatingMount.can_transition_to(CreatingFrame));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use LifecycleState::*;
        assert!(Failed.can_transition_to(Destroyed));
        assert!(!Failed.can_transition_to(LocatingMount));
        assert!(!Destroyed.can_transition_to(Destroyed));
        assert!(!Destroyed.can_transition_to(Failed));
        assert!(!Ready.can_transition_to(LocatingMount));
        assert!(!Created.can_transition_to(Ready));
        assert!(AwaitingReady.can_transition_to(LocatingMount));
    }

    struct Scripted {
        host: Rc<FakeHost>,
        lifecycle: Lifecycle,
        outcomes: RefCell<VecDeque<Result<(), WidgetError>>>,
        policy: RetryPolicy,
        log: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(max_attempts: u32, outcomes: Vec<Result<(), WidgetError>>) -> Self {
            Self {
                host: FakeHost::new(),
                lifecycle: Lifecycle::new(),
                outcomes: RefCell::new(outcomes.into()),
                policy: RetryPolicy {
                    max_attempts,
                    delay: Duration::from_secs(2),
                },
                log: RefCell::new(Vec::new()),
            }
        }
    }

    impl InitSequence for Scripted {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn sleep(&self, duration: Duration) -> HostFuture<()> {
            self.host.sleep(duration)
        }

        fn retry_policy(&self) -> RetryPolicy {
            self.policy
        }

        async fn attempt(&self) -> Result<(), WidgetError> {
            self.log.borrow_mut().push("attempt".to_string());
            let outcome = self
                .outcomes
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(WidgetError::timeout("script exhausted")));
            if outcome.is_ok() {
                assert!(self.lifecycle.advance(LifecycleState::CreatingFrame));
                assert!(self.lifecycle.advance(LifecycleState::AwaitingReady));
            }
            outcome
        }

        fn discard_attempt(&self) {
            self.log.borrow_mut().push("discard".to_string());
        }

        fn complete(&self) {
            self.log.borrow_mut().push("complete".to_string());
        }

        fn fail(&self, error: &WidgetError) {
            self.log.borrow_mut().push(format!("fail:{}", error.code));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_a_retry() {
        let sequence = Scripted::new(3, vec![Err(WidgetError::timeout("slow")), Ok(())]);
        let started = tokio::time::Instant::now();
        drive(&sequence).await;

        assert_eq!(sequence.lifecycle.current(), LifecycleState::Ready);
        assert_eq!(sequence.lifecycle.attempts(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(
            *sequence.log.borrow(),
            vec!["attempt", "discard", "attempt", "complete"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_exactly_once() {
        let sequence = Scripted::new(
            3,
            vec![
                Err(WidgetError::timeout("one")),
                Err(WidgetError::timeout("two")),
                Err(WidgetError::iframe_load_failed("three")),
            ],
        );
        let started = tokio::time::Instant::now();
        drive(&sequence).await;

        assert_eq!(sequence.lifecycle.current(), LifecycleState::Failed);
        assert_eq!(sequence.lifecycle.attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        let log = sequence.log.borrow();
        assert_eq!(log.iter().filter(|entry| *entry == "attempt").count(), 3);
        assert_eq!(
            log.iter().filter(|entry| entry.starts_with("fail:")).collect::<Vec<_>>(),
            vec!["fail:IFRAME_LOAD_FAILED"]
        );
        assert_eq!(sequence.host.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_fails_without_delay() {
        let sequence = Scripted::new(1, vec![Err(WidgetError::container_not_found("m1"))]);
        let started = tokio::time::Instant::now();
        drive(&sequence).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(
            *sequence.log.borrow(),
            vec!["attempt", "discard", "fail:CONTAINER_NOT_FOUND"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_sequence_does_not_run() {
        let sequence = Scripted::new(3, vec![Ok(())]);
        assert!(sequence.lifecycle.advance(LifecycleState::Destroyed));
        drive(&sequence).await;
        assert!(sequence.log.borrow().is_empty());
    }
}
