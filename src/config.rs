//! Builder configuration: TOML decoding, defaulting, and validation.
//!
//! The configuration file describes one container build: cluster connection
//! settings, the instance to create, its root filesystem and secondary mount
//! points, network interfaces, and the provisioner commands to run inside it.
//! `load` produces a fully defaulted, validated `BuildConfig`; everything
//! downstream treats the result as ready to use.

use crate::errors::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

// Hostnames double as template names, so they must be valid DNS names.
static DNS_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:(?:[a-zA-Z0-9](?:[a-zA-Z0-9\-]*[a-zA-Z0-9])?)\.)*(?:[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?))$",
    )
    .unwrap()
});

/// Cluster connection settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConnectionConfig {
    /// Base URL of the cluster API, e.g. `https://pve.example.org:8006`.
    #[serde(default)]
    pub url: String,
    /// API user, e.g. `root@pam`.
    #[serde(default)]
    pub username: String,
    /// Password for ticket-based login. Ignored when `token` is set.
    #[serde(default)]
    pub password: Option<String>,
    /// API token value for token-based auth.
    #[serde(default)]
    pub token: Option<String>,
    /// Cluster node the instance is created on.
    #[serde(default)]
    pub node: String,
    /// Skip TLS certificate validation (self-signed cluster certs).
    #[serde(default)]
    pub skip_tls_verify: bool,
    /// Timeout in seconds for cluster-side tasks.
    #[serde(default)]
    pub task_timeout_secs: u64,
}

/// One filesystem mount for the instance.
///
/// The root filesystem uses the same shape; its `backup` flag is ignored
/// because the cluster API does not accept it on the root mount.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MountPointConfig {
    #[serde(default)]
    pub storage_id: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub acl: bool,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub quota: bool,
    #[serde(default)]
    pub replicate: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub disk_size: String,
}

/// One network interface for the instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkInterfaceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bridge: String,
    #[serde(default)]
    pub firewall: bool,
    #[serde(default)]
    pub gateway_ipv4: String,
    #[serde(default)]
    pub gateway_ipv6: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub ipv4_address: String,
    #[serde(default)]
    pub ipv6_address: String,
    #[serde(default)]
    pub link_down: bool,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub rate_mbps: u32,
    #[serde(default)]
    pub tag: u32,
    #[serde(default)]
    pub trunks: Vec<String>,
    #[serde(default, rename = "type")]
    pub iface_type: String,
}

/// One provisioner block: inline commands and/or a file upload, executed
/// through the command channel by the built-in shell hook.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvisionerConfig {
    /// Shell commands run inside the instance, in order.
    #[serde(default)]
    pub inline: Vec<String>,
    /// Local file uploaded into the instance before `inline` runs.
    #[serde(default)]
    pub source: Option<String>,
    /// In-instance destination path for `source`.
    #[serde(default)]
    pub destination: Option<String>,
}

/// The full, validated build configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub connection: ConnectionConfig,

    // Required
    #[serde(default)]
    pub os_template: String,
    /// Explicit instance id; 0 means "allocate the next free id".
    #[serde(default)]
    pub vm_id: u32,

    // Optional instance settings
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub cmode: String,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub cores: i64,
    #[serde(default)]
    pub cpu_limit: u32,
    #[serde(default)]
    pub cpu_units: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: String,
    /// Delete a pre-existing instance matching this build's id or hostname
    /// before creating the new one.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub hookscript: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ignore_unpack_errors: bool,
    #[serde(default)]
    pub lock: String,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub nameserver: String,
    #[serde(default)]
    pub on_boot: bool,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub user_password: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub protection: bool,
    #[serde(default)]
    pub restore: bool,
    #[serde(default)]
    pub search_domain: String,
    #[serde(default)]
    pub ssh_public_keys: String,
    /// Start the instance after creation.
    #[serde(default = "default_true")]
    pub start: bool,
    #[serde(default)]
    pub startup: String,
    #[serde(default)]
    pub storage: String,
    #[serde(default)]
    pub swap: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Convert the instance to a template once the build succeeds.
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub tty: i64,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub unprivileged: bool,

    /// The exec helper used to reach into instances on the cluster node.
    #[serde(default = "default_pct_cmd")]
    pub pct_cmd: String,

    pub rootfs: Option<MountPointConfig>,
    #[serde(default)]
    pub mount_points: Vec<MountPointConfig>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    #[serde(default)]
    pub provisioners: Vec<ProvisionerConfig>,
}

fn default_true() -> bool {
    true
}

fn default_pct_cmd() -> String {
    "pct".to_string()
}

impl BuildConfig {
    /// Load, default, and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: BuildConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.prepare();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string, with defaulting and
    /// validation applied. Used by tests and embedding callers.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: BuildConfig =
            toml::from_str(raw).map_err(|source| ConfigError::ParseFailed {
                path: "<inline>".into(),
                source,
            })?;
        config.prepare();
        config.validate()?;
        Ok(config)
    }

    /// Fill in cluster API defaults for anything the file left unset or out
    /// of range.
    fn prepare(&mut self) {
        if self.connection.task_timeout_secs == 0 {
            self.connection.task_timeout_secs = 60;
        }
        if self.arch.is_empty() {
            self.arch = "amd64".to_string();
        }
        if self.memory < 16 {
            debug!(memory = self.memory, "memory too small, using default 512");
            self.memory = 512;
        }
        if self.cores < 1 {
            debug!(cores = self.cores, "core count too small, using default 1");
            self.cores = 1;
        }
        if self.swap < 0 {
            debug!(swap = self.swap, "swap size too small, using default 512");
            self.swap = 512;
        }
        if !matches!(self.cmode.as_str(), "shell" | "tty" | "console") {
            debug!(cmode = %self.cmode, "invalid console mode, using default tty");
            self.cmode = "tty".to_string();
        }
        if self.tty <= 0 || self.tty > 6 {
            debug!(tty = self.tty, "invalid tty count, using default 2");
            self.tty = 2;
        }
        if self.cpu_units < 8 {
            self.cpu_units = 1024;
        }
        if self.hostname.is_empty() {
            self.hostname = format!("lxcsmith-{}", Uuid::new_v4());
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        if self.connection.username.is_empty() {
            return Err(ConfigError::MissingUsername);
        }
        if self.connection.password.is_none() && self.connection.token.is_none() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.connection.node.is_empty() {
            return Err(ConfigError::MissingNode);
        }
        if self.os_template.is_empty() {
            return Err(ConfigError::MissingOsTemplate);
        }
        // Instance ids are unsigned 32-bit integers limited to this range by
        // the cluster control plane.
        if self.vm_id != 0 && !(100..=999_999_999).contains(&self.vm_id) {
            return Err(ConfigError::VmIdOutOfRange { id: self.vm_id });
        }
        if !DNS_NAME_REGEX.is_match(&self.hostname) {
            return Err(ConfigError::InvalidHostname {
                hostname: self.hostname.clone(),
            });
        }
        if self.rootfs.is_none() {
            return Err(ConfigError::MissingRootFs);
        }
        Ok(())
    }
}
