//! The ordered step orchestrator.
//!
//! Steps run sequentially against one shared `BuildContext`. The runner
//! keeps an explicit stack of entered steps; once the walk ends (success,
//! halt, or cancellation) every entered step's cleanup runs in strict
//! reverse order. A cleanup failure is reported and the unwind continues.

use super::context::BuildContext;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What the pipeline should do after a step's entry action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Advance to the next step.
    Continue,
    /// Stop advancing; the step recorded its error in the context.
    Halt,
    /// Stop advancing and mark the build cancelled.
    Cancel,
}

/// One stage of the build pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut BuildContext) -> StepAction;

    /// Release whatever the entry action acquired. Runs during unwind even
    /// when the step itself halted; errors are surfaced by the runner but
    /// never stop the remaining cleanups.
    async fn cleanup(&self, _ctx: &mut BuildContext) -> Result<(), crate::errors::BuildError> {
        Ok(())
    }
}

pub struct StepRunner {
    steps: Vec<Box<dyn Step>>,
}

impl StepRunner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Walk the steps, then unwind. The outcome is recorded in `ctx`
    /// (`error`, `cancelled`, or neither on full success).
    pub async fn run(&self, ctx: &mut BuildContext, cancel: &CancellationToken) {
        let mut entered: Vec<usize> = Vec::new();

        for (idx, step) in self.steps.iter().enumerate() {
            // Cancellation is observed between steps; a running step
            // finishes on its own terms.
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping before step '{}'", step.name());
                ctx.cancelled = true;
                break;
            }

            debug!(step = step.name(), "entering step");
            entered.push(idx);
            match step.run(ctx).await {
                StepAction::Continue => {}
                StepAction::Halt => break,
                StepAction::Cancel => {
                    ctx.cancelled = true;
                    break;
                }
            }
        }

        for idx in entered.iter().rev() {
            let step = &self.steps[*idx];
            debug!(step = step.name(), "cleaning up step");
            if let Err(err) = step.cleanup(ctx).await {
                error!(step = step.name(), %err, "cleanup failed, continuing unwind");
            }
        }
    }
}
