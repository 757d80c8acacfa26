//! Typed error hierarchy for the lxcsmith builder.
//!
//! Four top-level enums cover the four subsystems:
//! - `ConfigError` — configuration decoding and validation failures
//! - `ClusterError` — cluster API failures
//! - `ChannelError` — command channel and transport failures
//! - `BuildError` — build orchestration failures

use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("os_template must be specified")]
    MissingOsTemplate,

    #[error("rootfs block must be specified")]
    MissingRootFs,

    #[error("vm_id must be in range 100-999999999, got {id}")]
    VmIdOutOfRange { id: u32 },

    #[error("hostname '{hostname}' is not a valid DNS name")]
    InvalidHostname { hostname: String },

    #[error("connection url must be specified")]
    MissingUrl,

    #[error("connection username must be specified")]
    MissingUsername,

    #[error("connection password or token must be specified")]
    MissingCredentials,

    #[error("connection node must be specified")]
    MissingNode,
}

/// Errors from the cluster API client.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cluster API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Invalid cluster url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

impl ClusterError {
    /// Whether this error is a lookup miss rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    /// Whether a creation failure was caused by another actor claiming the
    /// instance id between allocation and creation. The marker string is
    /// what the cluster control plane reports for this race.
    pub fn is_duplicate_id(&self) -> bool {
        match self {
            ClusterError::Api { message, .. } => message.contains("already exists on node"),
            _ => false,
        }
    }
}

/// Errors from the command channel and its transports.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to spawn command process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to stage upload: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Command exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("Command result was dropped before completion")]
    ResultDropped,

    #[error("{operation} is not implemented for lxc")]
    Unsupported { operation: &'static str },

    #[error("Tunnel transport failed: {message}")]
    Tunnel { message: String },
}

/// Errors from the build orchestration pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error creating instance: {0}")]
    Create(#[source] ClusterError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("found multiple instances with hostname '{hostname}', ids: {ids:?}")]
    AmbiguousReplaceTarget { hostname: String, ids: Vec<u32> },

    #[error("failed to get IP address after {attempts} retries")]
    AddressTimeout { attempts: u32 },

    #[error("Provisioning failed: {0}")]
    Provision(#[source] anyhow::Error),

    #[error("build was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
