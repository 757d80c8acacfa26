//! Cluster-side instance description and device parameter rendering.
//!
//! `InstanceSpec` is built once per creation attempt from the validated
//! configuration and rendered into the flat key/value form the cluster API
//! accepts. Optional fields that are unset are absent from the rendered
//! parameters rather than written as empty strings or zeros.

use crate::config::{BuildConfig, MountPointConfig, NetworkInterfaceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity and location of one instance on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    id: u32,
    node: String,
}

impl InstanceRef {
    pub fn new(id: u32, node: impl Into<String>) -> Self {
        Self {
            id,
            node: node.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (node {})", self.id, self.node)
    }
}

/// The cluster-facing description of the instance to create.
///
/// Identity is deliberately not part of the spec: the create step resolves
/// an id separately and may substitute a fresh one on retry, while the spec
/// itself stays fixed for the whole creation loop.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub arch: String,
    pub cmode: String,
    pub console: bool,
    pub cores: i64,
    pub cpu_limit: u32,
    pub cpu_units: i64,
    pub description: String,
    pub features: String,
    pub force: bool,
    pub hookscript: String,
    pub hostname: String,
    pub ignore_unpack_errors: bool,
    pub lock: String,
    pub memory: i64,
    pub nameserver: String,
    pub on_boot: bool,
    pub os_template: String,
    pub os_type: String,
    pub password: String,
    pub pool: String,
    pub protection: bool,
    pub restore: bool,
    pub rootfs: MountPointConfig,
    pub mount_points: Vec<MountPointConfig>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub search_domain: String,
    pub ssh_public_keys: String,
    pub start: bool,
    pub startup: String,
    pub storage: String,
    pub swap: i64,
    pub tags: Vec<String>,
    pub template: bool,
    pub timezone: String,
    pub tty: i64,
    pub unique: bool,
    pub unprivileged: bool,
}

impl InstanceSpec {
    /// Build the spec from a validated configuration.
    ///
    /// The caller guarantees `config.rootfs` is present (validation rejects
    /// configurations without it).
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            arch: config.arch.clone(),
            cmode: config.cmode.clone(),
            console: config.console,
            cores: config.cores,
            cpu_limit: config.cpu_limit,
            cpu_units: config.cpu_units,
            description: config.description.clone(),
            features: config.features.clone(),
            force: config.force,
            hookscript: config.hookscript.clone(),
            hostname: config.hostname.clone(),
            ignore_unpack_errors: config.ignore_unpack_errors,
            lock: config.lock.clone(),
            memory: config.memory,
            nameserver: config.nameserver.clone(),
            on_boot: config.on_boot,
            os_template: config.os_template.clone(),
            os_type: config.os_type.clone(),
            password: config.user_password.clone(),
            pool: config.pool.clone(),
            protection: config.protection,
            restore: config.restore,
            rootfs: config.rootfs.clone().unwrap_or_default(),
            mount_points: config.mount_points.clone(),
            network_interfaces: config.network_interfaces.clone(),
            search_domain: config.search_domain.clone(),
            ssh_public_keys: config.ssh_public_keys.clone(),
            start: config.start,
            startup: config.startup.clone(),
            storage: config.storage.clone(),
            swap: config.swap,
            tags: config.tags.clone(),
            template: config.template,
            timezone: config.timezone.clone(),
            tty: config.tty,
            unique: config.unique,
            unprivileged: config.unprivileged,
        }
    }

    /// Render the flat parameter map for the cluster's create call.
    pub fn creation_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();

        set_param_if_defined(&mut params, "arch", &self.arch);
        set_param_if_defined(&mut params, "cmode", &self.cmode);
        set_param_if_defined(&mut params, "description", &self.description);
        set_param_if_defined(&mut params, "features", &self.features);
        set_param_if_defined(&mut params, "hookscript", &self.hookscript);
        set_param_if_defined(&mut params, "hostname", &self.hostname);
        set_param_if_defined(&mut params, "lock", &self.lock);
        set_param_if_defined(&mut params, "nameserver", &self.nameserver);
        set_param_if_defined(&mut params, "ostemplate", &self.os_template);
        set_param_if_defined(&mut params, "ostype", &self.os_type);
        set_param_if_defined(&mut params, "password", &self.password);
        set_param_if_defined(&mut params, "pool", &self.pool);
        set_param_if_defined(&mut params, "searchdomain", &self.search_domain);
        set_param_if_defined(&mut params, "ssh-public-keys", &self.ssh_public_keys);
        set_param_if_defined(&mut params, "startup", &self.startup);
        set_param_if_defined(&mut params, "storage", &self.storage);
        set_param_if_defined(&mut params, "timezone", &self.timezone);
        if !self.tags.is_empty() {
            params.insert("tags".to_string(), self.tags.join(","));
        }

        params.insert("cores".to_string(), self.cores.to_string());
        params.insert("cpuunits".to_string(), self.cpu_units.to_string());
        params.insert("memory".to_string(), self.memory.to_string());
        params.insert("swap".to_string(), self.swap.to_string());
        params.insert("tty".to_string(), self.tty.to_string());
        if self.cpu_limit != 0 {
            params.insert("cpulimit".to_string(), self.cpu_limit.to_string());
        }

        // Flags default to off on the cluster side; only emit the ones set.
        for (key, flag) in [
            ("console", self.console),
            ("force", self.force),
            ("ignore-unpack-errors", self.ignore_unpack_errors),
            ("onboot", self.on_boot),
            ("protection", self.protection),
            ("restore", self.restore),
            ("start", self.start),
            ("template", self.template),
            ("unique", self.unique),
            ("unprivileged", self.unprivileged),
        ] {
            if flag {
                params.insert(key.to_string(), "1".to_string());
            }
        }

        params.insert("rootfs".to_string(), render_device(&mount_device_params(&self.rootfs, true)));
        for (idx, mount) in self.mount_points.iter().enumerate() {
            params.insert(format!("mp{idx}"), render_device(&mount_device_params(mount, false)));
        }
        for (idx, nic) in self.network_interfaces.iter().enumerate() {
            params.insert(format!("net{idx}"), render_device(&network_device_params(nic)));
        }

        params
    }
}

/// Render the device parameters for one mount.
///
/// The root mount omits the `backup` flag; the cluster API rejects it there.
pub fn mount_device_params(mount: &MountPointConfig, is_rootfs: bool) -> BTreeMap<String, String> {
    let mut dev = BTreeMap::new();
    set_param_if_defined(&mut dev, "storage", &mount.storage_id);
    set_param_if_defined(&mut dev, "volume", &mount.volume);
    dev.insert("size".to_string(), mount.disk_size.clone());
    if !is_rootfs {
        set_param_if_defined(&mut dev, "mp", &mount.path);
    }
    if mount.acl {
        dev.insert("acl".to_string(), "1".to_string());
    }
    dev.insert("quota".to_string(), bool_param(mount.quota));
    dev.insert("replicate".to_string(), bool_param(mount.replicate));
    dev.insert("ro".to_string(), bool_param(mount.readonly));
    dev.insert("shared".to_string(), bool_param(mount.shared));
    if !is_rootfs {
        dev.insert("backup".to_string(), bool_param(mount.backup));
    }
    dev
}

/// Render the device parameters for one network interface.
pub fn network_device_params(nic: &NetworkInterfaceConfig) -> BTreeMap<String, String> {
    let mut dev = BTreeMap::new();
    set_param_if_defined(&mut dev, "name", &nic.name);
    set_param_if_defined(&mut dev, "bridge", &nic.bridge);
    set_param_if_defined(&mut dev, "gw", &nic.gateway_ipv4);
    set_param_if_defined(&mut dev, "gw6", &nic.gateway_ipv6);
    set_param_if_defined(&mut dev, "hwaddr", &nic.mac_address);
    set_param_if_defined(&mut dev, "ip", &nic.ipv4_address);
    set_param_if_defined(&mut dev, "ip6", &nic.ipv6_address);
    set_param_if_defined(&mut dev, "type", &nic.iface_type);
    if !nic.trunks.is_empty() {
        dev.insert("trunks".to_string(), nic.trunks.join(":"));
    }
    if nic.mtu != 0 {
        dev.insert("mtu".to_string(), nic.mtu.to_string());
    }
    if nic.rate_mbps != 0 {
        dev.insert("rate".to_string(), nic.rate_mbps.to_string());
    }
    if nic.tag != 0 {
        dev.insert("tag".to_string(), nic.tag.to_string());
    }
    dev.insert("firewall".to_string(), bool_param(nic.firewall));
    dev.insert("link_down".to_string(), bool_param(nic.link_down));
    dev
}

fn set_param_if_defined(dev: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        dev.insert(key.to_string(), value.to_string());
    }
}

fn bool_param(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn render_device(dev: &BTreeMap<String, String>) -> String {
    dev.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
