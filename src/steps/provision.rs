//! Hands the command channel to the provisioning engine.
//!
//! The engine is an external collaborator behind the `ProvisionHook` trait;
//! `ShellHook` is the built-in engine the CLI uses, running the configured
//! provisioner blocks through the channel.

use crate::build::{BuildContext, Step, StepAction};
use crate::channel::CommandChannel;
use crate::cluster::InstanceRef;
use crate::config::ProvisionerConfig;
use crate::errors::BuildError;
use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// The execution surface the provisioning engine sees: the instance under
/// construction and the command channel into it.
pub struct HookSurface<'a> {
    pub instance: &'a InstanceRef,
    pub channel: &'a CommandChannel,
}

/// An external provisioning engine. Runs synchronously from the pipeline's
/// point of view and may extend `metadata` for downstream consumers.
#[async_trait]
pub trait ProvisionHook: Send + Sync {
    async fn run(&self, surface: HookSurface<'_>, metadata: &mut Value) -> anyhow::Result<()>;
}

pub struct ProvisionStep {
    hook: Arc<dyn ProvisionHook>,
}

impl ProvisionStep {
    pub fn new(hook: Arc<dyn ProvisionHook>) -> Self {
        Self { hook }
    }
}

#[async_trait]
impl Step for ProvisionStep {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn run(&self, ctx: &mut BuildContext) -> StepAction {
        let mut metadata = json!({
            "build_id": uuid::Uuid::new_v4().to_string(),
            "started_at": chrono::Utc::now().to_rfc3339(),
            "hostname": ctx.config.hostname.clone(),
            "instance_id": ctx.instance.as_ref().map(InstanceRef::id),
            "node": ctx.config.connection.node.clone(),
            "address": ctx.address.clone(),
        });

        let (channel, instance) = match (&ctx.channel, &ctx.instance) {
            (Some(channel), Some(instance)) => (channel, instance),
            _ => {
                return ctx.fail(BuildError::Other(
                    "command channel not established before provisioning".to_string(),
                ));
            }
        };

        info!("running the provision hook");
        let result = self
            .hook
            .run(HookSurface { instance, channel }, &mut metadata)
            .await;

        if let Err(err) = result {
            return ctx.fail(BuildError::Provision(err));
        }
        ctx.generated = Some(metadata);
        StepAction::Continue
    }
}

/// Runs the configured `[[provisioners]]` blocks: an optional file upload
/// followed by inline commands, each through the command channel.
pub struct ShellHook {
    provisioners: Vec<ProvisionerConfig>,
}

impl ShellHook {
    pub fn new(provisioners: Vec<ProvisionerConfig>) -> Self {
        Self { provisioners }
    }
}

#[async_trait]
impl ProvisionHook for ShellHook {
    async fn run(&self, surface: HookSurface<'_>, metadata: &mut Value) -> anyhow::Result<()> {
        let mut commands_run = 0u64;
        for provisioner in &self.provisioners {
            if let (Some(source), Some(destination)) =
                (&provisioner.source, &provisioner.destination)
            {
                let contents = tokio::fs::read(source)
                    .await
                    .with_context(|| format!("reading provisioner source {source}"))?;
                surface
                    .channel
                    .upload(destination, &contents)
                    .await
                    .with_context(|| format!("uploading {source} to {destination}"))?;
            }
            for command in &provisioner.inline {
                info!(%command, "running provisioner command");
                surface
                    .channel
                    .exec(command)
                    .await
                    .with_context(|| format!("provisioner command failed: {command}"))?;
                commands_run += 1;
            }
        }
        if let Value::Object(map) = metadata {
            map.insert("commands_run".to_string(), Value::from(commands_run));
        }
        Ok(())
    }
}
