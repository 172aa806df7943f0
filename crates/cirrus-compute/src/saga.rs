//! Ordered compensable actions
//!
//! A [`Saga`] runs its steps in order against a shared context. When step
//! *k* fails, the compensations of steps `1..k-1` run in reverse order and
//! the original error is returned. A failing compensation does not stop the
//! unwind; its message is collected into [`Error::CompensationFailed`].

use futures::future::BoxFuture;
use tracing::{debug, warn};

use cirrus_common::{Error, Result};

/// An action or compensation over the saga context
pub type StepFn<C> = for<'c> fn(&'c mut C) -> BoxFuture<'c, Result<()>>;

struct Step<C> {
    name: &'static str,
    action: StepFn<C>,
    compensation: Option<StepFn<C>>,
}

/// An ordered list of steps sharing a mutable context
pub struct Saga<C> {
    name: &'static str,
    steps: Vec<Step<C>>,
}

impl<C: Send> Saga<C> {
    /// Start an empty saga
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Append a step with no compensation
    pub fn step(mut self, name: &'static str, action: StepFn<C>) -> Self {
        self.steps.push(Step {
            name,
            action,
            compensation: None,
        });
        self
    }

    /// Append a step undone by `compensation` if a later step fails
    pub fn compensated_step(
        mut self,
        name: &'static str,
        action: StepFn<C>,
        compensation: StepFn<C>,
    ) -> Self {
        self.steps.push(Step {
            name,
            action,
            compensation: Some(compensation),
        });
        self
    }

    /// Execute the saga
    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(saga = self.name, step = step.name, "running saga step");
            if let Err(err) = (step.action)(ctx).await {
                warn!(
                    saga = self.name,
                    step = step.name,
                    error = %err,
                    "saga step failed, compensating"
                );
                return Err(self.unwind(index, ctx, err).await);
            }
        }
        Ok(())
    }

    async fn unwind(&self, failed: usize, ctx: &mut C, err: Error) -> Error {
        let mut failures = Vec::new();

        for step in self.steps[..failed].iter().rev() {
            let Some(compensation) = step.compensation else {
                continue;
            };
            if let Err(e) = compensation(ctx).await {
                warn!(
                    saga = self.name,
                    step = step.name,
                    error = %e,
                    "compensation failed"
                );
                failures.push(format!("{}: {}", step.name, e));
            }
        }

        if failures.is_empty() {
            err
        } else {
            Error::CompensationFailed {
                failures,
                source: Box::new(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[derive(Default)]
    struct Ledger {
        log: Vec<&'static str>,
        fail_action: Option<&'static str>,
        fail_compensation: Option<&'static str>,
    }

    impl Ledger {
        fn record(&mut self, entry: &'static str) -> Result<()> {
            self.log.push(entry);
            if self.fail_action == Some(entry) || self.fail_compensation == Some(entry) {
                return Err(Error::backend_status(entry, 500));
            }
            Ok(())
        }
    }

    fn a(l: &mut Ledger) -> BoxFuture<'_, Result<()>> {
        async move { l.record("a") }.boxed()
    }
    fn undo_a(l: &mut Ledger) -> BoxFuture<'_, Result<()>> {
        async move { l.record("undo a") }.boxed()
    }
    fn b(l: &mut Ledger) -> BoxFuture<'_, Result<()>> {
        async move { l.record("b") }.boxed()
    }
    fn undo_b(l: &mut Ledger) -> BoxFuture<'_, Result<()>> {
        async move { l.record("undo b") }.boxed()
    }
    fn c(l: &mut Ledger) -> BoxFuture<'_, Result<()>> {
        async move { l.record("c") }.boxed()
    }

    fn saga() -> Saga<Ledger> {
        Saga::new("test")
            .compensated_step("a", a, undo_a)
            .compensated_step("b", b, undo_b)
            .step("c", c)
    }

    #[tokio::test]
    async fn runs_all_steps_in_order() {
        let mut ledger = Ledger::default();
        saga().run(&mut ledger).await.unwrap();
        assert_eq!(ledger.log, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failure_unwinds_completed_steps_in_reverse() {
        let mut ledger = Ledger {
            fail_action: Some("c"),
            ..Default::default()
        };
        let err = saga().run(&mut ledger).await.unwrap_err();

        assert_eq!(ledger.log, vec!["a", "b", "c", "undo b", "undo a"]);
        match err {
            Error::BackendStatus { operation, code } => {
                assert_eq!(operation, "c");
                assert_eq!(code, 500);
            }
            other => panic!("expected the original error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_step_is_not_compensated() {
        let mut ledger = Ledger {
            fail_action: Some("b"),
            ..Default::default()
        };
        saga().run(&mut ledger).await.unwrap_err();
        assert_eq!(ledger.log, vec!["a", "b", "undo a"]);
    }

    #[tokio::test]
    async fn compensation_failure_is_reported_and_unwind_continues() {
        let mut ledger = Ledger {
            fail_action: Some("c"),
            fail_compensation: Some("undo b"),
            ..Default::default()
        };
        let err = saga().run(&mut ledger).await.unwrap_err();

        assert_eq!(ledger.log, vec!["a", "b", "c", "undo b", "undo a"]);
        match err {
            Error::CompensationFailed { failures, source } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("b:"));
                assert!(matches!(*source, Error::BackendStatus { .. }));
            }
            other => panic!("expected compensation failure, got {other:?}"),
        }
    }
}
