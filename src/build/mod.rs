//! Build orchestration: wires the step pipeline together and reports the
//! outcome.

pub mod context;
pub mod runner;

pub use context::BuildContext;
pub use runner::{Step, StepAction, StepRunner};

use crate::channel::Tunnel;
use crate::cluster::{ClusterApi, InstanceRef};
use crate::config::BuildConfig;
use crate::errors::BuildError;
use crate::steps::{
    CreateInstanceStep, OpenChannelStep, ProvisionHook, ProvisionStep, ResolveAddressStep,
    SuccessStep,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What a finished build hands to downstream artifact construction.
#[derive(Debug)]
pub struct BuildOutput {
    pub instance: InstanceRef,
    /// Metadata accumulated by the provisioning hook.
    pub generated: serde_json::Value,
}

/// Drives one instance's lifecycle end-to-end, sequentially.
pub struct Builder {
    config: BuildConfig,
    client: Arc<dyn ClusterApi>,
}

impl Builder {
    pub fn new(config: BuildConfig, client: Arc<dyn ClusterApi>) -> Self {
        Self { config, client }
    }

    /// Run the build pipeline. On success the created instance survives as
    /// the finished artifact; on failure or cancellation everything the
    /// pipeline created is unwound.
    pub async fn run(
        &self,
        hook: Arc<dyn ProvisionHook>,
        tunnel: Option<Arc<dyn Tunnel>>,
        cancel: CancellationToken,
    ) -> Result<BuildOutput, BuildError> {
        let mut ctx = BuildContext::new(Arc::clone(&self.client), self.config.clone());

        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(CreateInstanceStep),
            Box::new(OpenChannelStep::new(tunnel)),
            Box::new(ResolveAddressStep),
            Box::new(ProvisionStep::new(hook)),
            Box::new(SuccessStep),
        ];

        StepRunner::new(steps).run(&mut ctx, &cancel).await;

        if let Some(error) = ctx.error.take() {
            return Err(error);
        }
        if ctx.cancelled {
            return Err(BuildError::Cancelled);
        }

        // The pipeline only reaches here when every step ran, so the
        // instance reference must have been deposited.
        let instance = ctx
            .instance
            .ok_or_else(|| BuildError::Other("instance reference was never recorded".to_string()))?;
        info!(instance = %instance, "build finished");
        Ok(BuildOutput {
            instance,
            generated: ctx.generated.unwrap_or(serde_json::Value::Null),
        })
    }
}
