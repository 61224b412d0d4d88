//! Bounded batch loops.
//!
//! A [`Budget`] caps both the number of passes and the wall-clock time of a
//! loop that repeatedly calls a bounded batch operation. Uses
//! `tokio::time::Instant` so paused-time tests can drive it.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Budget {
    max_iterations: u32,
    max_duration: Duration,
    started: Instant,
}

impl Budget {
    /// Starts the clock now.
    pub fn start(max_iterations: u32, max_duration: Duration) -> Self {
        Self {
            max_iterations,
            max_duration,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_exhausted(&self) -> bool {
        self.elapsed() >= self.max_duration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A pass made zero progress.
    Drained,
    IterationCap,
    TimeBudget,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetedRun<E> {
    pub iterations: u32,
    /// Sum of the per-pass progress counts.
    pub processed: u64,
    pub stop: StopReason,
    pub error: Option<E>,
}

/// Call `step` until it reports zero progress, fails, or the budget runs out.
///
/// The time budget is checked before each pass, so a pass that has started
/// always finishes. `step` receives the zero-based pass index.
pub async fn run_budgeted<F, Fut, E>(budget: &Budget, mut step: F) -> BudgetedRun<E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<u64, E>>,
{
    let mut run = BudgetedRun {
        iterations: 0,
        processed: 0,
        stop: StopReason::IterationCap,
        error: None,
    };

    while run.iterations < budget.max_iterations {
        if budget.time_exhausted() {
            run.stop = StopReason::TimeBudget;
            return run;
        }

        let pass = run.iterations;
        run.iterations += 1;
        match step(pass).await {
            Ok(0) => {
                run.stop = StopReason::Drained;
                return run;
            }
            Ok(n) => run.processed += n,
            Err(e) => {
                run.stop = StopReason::Failed;
                run.error = Some(e);
                return run;
            }
        }
    }

    run
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_when_a_pass_makes_no_progress() {
        let budget = Budget::start(20, Duration::from_secs(25));
        let mut remaining = 1_200u64;
        let run = run_budgeted(&budget, |_| {
            let n = remaining.min(500);
            remaining -= n;
            async move { Ok::<_, String>(n) }
        })
        .await;

        assert_eq!(run.stop, StopReason::Drained);
        assert_eq!(run.iterations, 4);
        assert_eq!(run.processed, 1_200);
    }

    #[tokio::test]
    async fn respects_iteration_cap() {
        let budget = Budget::start(3, Duration::from_secs(25));
        let run = run_budgeted(&budget, |_| async { Ok::<_, String>(500) }).await;
        assert_eq!(run.stop, StopReason::IterationCap);
        assert_eq!((run.iterations, run.processed), (3, 1_500));
    }

    #[tokio::test]
    async fn failure_stops_the_loop_and_keeps_the_error() {
        let budget = Budget::start(10, Duration::from_secs(25));
        let run = run_budgeted(&budget, |i| async move {
            if i == 2 { Err("link service down") } else { Ok(10) }
        })
        .await;
        assert_eq!(run.stop, StopReason::Failed);
        assert_eq!(run.error, Some("link service down"));
        assert_eq!((run.iterations, run.processed), (3, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_is_checked_between_passes() {
        let budget = Budget::start(20, Duration::from_secs(25));
        let run = run_budgeted(&budget, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>(1)
        })
        .await;
        // Passes start at t=0, 10 and 20; the check at t=30 stops the loop.
        assert_eq!(run.stop, StopReason::TimeBudget);
        assert_eq!(run.iterations, 3);
    }
}
