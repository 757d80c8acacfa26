//! Instance creation: spec building, identity resolution, force-replace,
//! and the duplicate-id retry loop.

use crate::build::{BuildContext, Step, StepAction};
use crate::cluster::{ClusterApi, InstanceRef, InstanceSpec};
use crate::config::BuildConfig;
use crate::errors::BuildError;
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Total creation attempts when an auto-allocated id loses the race to
/// another actor. Explicitly configured ids are never retried.
const MAX_DUPLICATE_ID_RETRIES: u32 = 3;

pub struct CreateInstanceStep;

/// Look for an existing instance matching this build's explicit id or its
/// hostname. Returns `None` when nothing matches; more than one hostname
/// match is an ambiguous force-delete target and fails loudly.
async fn find_existing_instance(
    config: &BuildConfig,
    client: &dyn ClusterApi,
) -> Result<Option<InstanceRef>, BuildError> {
    let existing = if config.vm_id > 0 {
        info!(id = config.vm_id, "looking up instance by id");
        match client.lookup_by_id(config.vm_id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    } else {
        info!(hostname = %config.hostname, "looking up instances by hostname");
        let matches = match client.lookup_by_hostname(&config.hostname).await {
            Ok(matches) => matches,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if matches.len() > 1 {
            return Err(BuildError::AmbiguousReplaceTarget {
                hostname: config.hostname.clone(),
                ids: matches.iter().map(InstanceRef::id).collect(),
            });
        }
        match matches.into_iter().next() {
            Some(instance) => instance,
            None => return Ok(None),
        }
    };

    // Templates and live instances are deleted identically; warn so the
    // operator can see a non-template workload is about to be replaced.
    let instance_config = client.instance_config(&existing).await.map_err(BuildError::from)?;
    if instance_config.get("template").is_none() {
        warn!(
            instance = %existing,
            "found matching instance but it is not a template, deleting it anyway"
        );
    }
    Ok(Some(existing))
}

#[async_trait]
impl Step for CreateInstanceStep {
    fn name(&self) -> &'static str {
        "create-instance"
    }

    async fn run(&self, ctx: &mut BuildContext) -> StepAction {
        info!("creating LXC container");
        let spec = InstanceSpec::from_config(&ctx.config);
        let client = std::sync::Arc::clone(&ctx.client);

        let mut attempt = 1;
        loop {
            let id = if ctx.config.vm_id != 0 {
                ctx.config.vm_id
            } else {
                info!("no instance id given, allocating next free id from the cluster");
                match client.next_free_id(0).await {
                    Ok(id) => id,
                    Err(err) => return ctx.fail(err.into()),
                }
            };

            if ctx.config.force {
                info!("force set, checking for an existing artifact on the cluster");
                match find_existing_instance(&ctx.config, client.as_ref()).await {
                    Ok(Some(existing)) => {
                        info!(instance = %existing, "deleting existing instance before create");
                        if let Err(err) = client.stop(&existing).await {
                            error!(%err, "error stopping existing instance");
                        }
                        if let Err(err) = client.delete(&existing).await {
                            error!(%err, "error deleting existing instance");
                            return ctx.fail(err.into());
                        }
                        info!(instance = %existing, "deleted existing instance");
                    }
                    Ok(None) => info!("no existing artifact found"),
                    Err(err) => return ctx.fail(err),
                }
            }

            let instance = InstanceRef::new(id, &ctx.config.connection.node);
            match client.create_instance(&spec, &instance).await {
                Ok(()) => {
                    info!(instance = %instance, "instance created");
                    ctx.instance = Some(instance);
                    return StepAction::Continue;
                }
                // Another actor claimed the id between allocation and
                // creation; only auto-allocated ids are retried.
                Err(err)
                    if ctx.config.vm_id == 0
                        && err.is_duplicate_id()
                        && attempt < MAX_DUPLICATE_ID_RETRIES =>
                {
                    info!("allocated instance id was already claimed, retrying");
                    attempt += 1;
                }
                Err(err) => return ctx.fail(BuildError::Create(err)),
            }
        }
    }

    async fn cleanup(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        // Nothing created, or the build finished and the instance is the
        // artifact: nothing to unwind.
        let Some(instance) = ctx.instance.clone() else {
            return Ok(());
        };
        if ctx.success {
            return Ok(());
        }

        info!(instance = %instance, "stopping container");
        if let Err(err) = ctx.client.stop(&instance).await {
            // Reported, but deletion is still attempted.
            error!(%err, "error stopping instance");
        }

        info!(instance = %instance, "deleting instance");
        if let Err(err) = ctx.client.delete(&instance).await {
            error!(%err, "error deleting instance, please delete it manually");
            return Err(err.into());
        }
        Ok(())
    }
}
