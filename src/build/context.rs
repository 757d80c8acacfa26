//! Shared per-build state.
//!
//! One `BuildContext` lives for the duration of one build. Steps read the
//! values earlier steps deposited and deposit their own outputs; by
//! convention a deposited value is never overwritten. Absence of a value
//! means "not yet produced".

use crate::channel::CommandChannel;
use crate::cluster::{ClusterApi, InstanceRef};
use crate::config::BuildConfig;
use crate::errors::BuildError;
use std::sync::Arc;
use tracing::error;

use super::runner::StepAction;

pub struct BuildContext {
    pub client: Arc<dyn ClusterApi>,
    pub config: BuildConfig,

    /// Deposited by the create step.
    pub instance: Option<InstanceRef>,
    /// Deposited by the open-channel step.
    pub channel: Option<CommandChannel>,
    /// Deposited by the address resolver.
    pub address: Option<String>,
    /// Deposited by the provision step.
    pub generated: Option<serde_json::Value>,

    /// Set by the success marker; cleanup routines consult this to decide
    /// whether the instance is a finished artifact or debris.
    pub success: bool,
    /// Set when an external cancellation was observed.
    pub cancelled: bool,
    /// First error recorded by a failing step.
    pub error: Option<BuildError>,
}

impl BuildContext {
    pub fn new(client: Arc<dyn ClusterApi>, config: BuildConfig) -> Self {
        Self {
            client,
            config,
            instance: None,
            channel: None,
            address: None,
            generated: None,
            success: false,
            cancelled: false,
            error: None,
        }
    }

    /// Record a step failure and halt the pipeline. Only the first recorded
    /// error is kept; it is what the build reports to the caller.
    pub fn fail(&mut self, error: BuildError) -> StepAction {
        error!(%error, "step failed");
        if self.error.is_none() {
            self.error = Some(error);
        }
        StepAction::Halt
    }
}
