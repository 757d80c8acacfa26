//! Establishes the command channel into the created instance.

use crate::build::{BuildContext, Step, StepAction};
use crate::channel::{CommandChannel, Tunnel};
use crate::errors::BuildError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Builds the channel over the tunnel session when one was supplied,
/// otherwise drives the instance locally from the cluster host.
pub struct OpenChannelStep {
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl OpenChannelStep {
    pub fn new(tunnel: Option<Arc<dyn Tunnel>>) -> Self {
        Self { tunnel }
    }
}

#[async_trait]
impl Step for OpenChannelStep {
    fn name(&self) -> &'static str {
        "open-channel"
    }

    async fn run(&self, ctx: &mut BuildContext) -> StepAction {
        let Some(instance) = ctx.instance.clone() else {
            return ctx.fail(BuildError::Other(
                "no instance reference available for the command channel".to_string(),
            ));
        };

        let channel = match &self.tunnel {
            Some(tunnel) => {
                info!(instance = %instance, "opening tunneled command channel");
                CommandChannel::tunneled(instance, &ctx.config.pct_cmd, Arc::clone(tunnel))
            }
            None => {
                info!(instance = %instance, "opening local command channel");
                CommandChannel::local(instance, &ctx.config.pct_cmd)
            }
        };
        ctx.channel = Some(channel);
        StepAction::Continue
    }
}
