//! Records that the build succeeded.

use crate::build::{BuildContext, Step, StepAction};
use async_trait::async_trait;

/// The final step. The success flag is what cleanup routines consult to
/// keep the finished instance instead of destroying it (there is no
/// difference between instances and templates when deleting).
pub struct SuccessStep;

#[async_trait]
impl Step for SuccessStep {
    fn name(&self) -> &'static str {
        "success"
    }

    async fn run(&self, ctx: &mut BuildContext) -> StepAction {
        ctx.success = true;
        StepAction::Continue
    }
}
