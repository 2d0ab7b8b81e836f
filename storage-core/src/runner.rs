// SPDX-License-Identifier: GPL-3.0-only

//! Sequential execution of multi-step operations.

use std::fmt::Display;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

/// Carries out one kind of step against the collaborators.
#[async_trait]
pub trait StepExecutor<S: Sync>: Send + Sync {
    async fn execute(&self, step: &S) -> Result<()>;
}

/// Where a sequence stopped.
#[derive(Debug)]
pub struct StepFailure {
    /// Index of the step that failed; every step before it completed.
    pub failed_at: usize,
    pub error: CoreError,
}

/// Run `steps[start..]` in order, stopping at the first failure.
///
/// Cancellation is checked before every step and never interrupts a step
/// that already started.
pub async fn run_steps<S, E>(
    steps: &[S],
    start: usize,
    executor: &E,
    cancel: &CancellationToken,
) -> std::result::Result<(), StepFailure>
where
    S: Display + Sync,
    E: StepExecutor<S> + ?Sized,
{
    for (position, step) in steps.iter().enumerate().skip(start) {
        if cancel.is_cancelled() {
            tracing::debug!(step = position, "sequence cancelled");
            return Err(StepFailure {
                failed_at: position,
                error: CoreError::Cancelled,
            });
        }

        tracing::info!(step = position + 1, total = steps.len(), "{step}");
        if let Err(error) = executor.execute(step).await {
            tracing::debug!(step = position, %error, "sequence stopped");
            return Err(StepFailure {
                failed_at: position,
                error,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::Mutex;

    use storage_contracts::{StorageError, StorageErrorKind};

    use super::*;

    struct Named(&'static str);

    impl fmt::Display for Named {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl StepExecutor<Named> for Recorder {
        async fn execute(&self, step: &Named) -> Result<()> {
            self.seen.lock().expect("recorder").push(step.0);
            if step.0 == "boom" {
                return Err(StorageError::new(StorageErrorKind::Internal, "boom").into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let steps = [Named("a"), Named("boom"), Named("c")];
        let recorder = Recorder::default();

        let failure = run_steps(&steps, 0, &recorder, &CancellationToken::new())
            .await
            .expect_err("second step fails");

        assert_eq!(failure.failed_at, 1);
        assert_eq!(*recorder.seen.lock().expect("recorder"), vec!["a", "boom"]);
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let steps = [Named("a"), Named("b"), Named("c")];
        let recorder = Recorder::default();

        run_steps(&steps, 1, &recorder, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(*recorder.seen.lock().expect("recorder"), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn cancelled_token_runs_nothing() {
        let steps = [Named("a")];
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = run_steps(&steps, 0, &recorder, &cancel)
            .await
            .expect_err("cancelled");

        assert!(matches!(failure.error, CoreError::Cancelled));
        assert!(recorder.seen.lock().expect("recorder").is_empty());
    }
}
