//! Polls the instance for its runtime network address.

use crate::build::{BuildContext, Step, StepAction};
use crate::errors::BuildError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ResolveAddressStep;

#[async_trait]
impl Step for ResolveAddressStep {
    fn name(&self) -> &'static str {
        "resolve-address"
    }

    async fn run(&self, ctx: &mut BuildContext) -> StepAction {
        info!("getting container IP address");
        let (channel, instance) = match (&ctx.channel, &ctx.instance) {
            (Some(channel), Some(instance)) => (channel, instance),
            _ => {
                return ctx.fail(BuildError::Other(
                    "command channel not established before address resolution".to_string(),
                ));
            }
        };

        let command = format!("lxc-info -n {} -i -H", instance.id());
        let mut address = String::new();

        for attempt in 1..=MAX_RETRIES {
            let result = match channel.exec_host(&command).await {
                Ok(result) => result,
                Err(err) => return ctx.fail(err.into()),
            };
            let output = result.output_utf8();
            let trimmed = output.trim_end();
            if !trimmed.is_empty() {
                address = trimmed.to_string();
                break;
            }
            info!("IP address not found yet, retrying...");
            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        if address.is_empty() {
            return ctx.fail(BuildError::AddressTimeout {
                attempts: MAX_RETRIES,
            });
        }

        debug!(%address, "container address resolved");
        ctx.address = Some(address);
        StepAction::Continue
    }
}
