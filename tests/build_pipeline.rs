//! End-to-end pipeline tests against an in-memory cluster and a scripted
//! tunnel session.

use async_trait::async_trait;
use lxcsmith::build::Builder;
use lxcsmith::channel::{CommandHandle, CommandRequest, Tunnel};
use lxcsmith::cluster::{ClusterApi, InstanceRef, InstanceSpec};
use lxcsmith::config::BuildConfig;
use lxcsmith::errors::{BuildError, ChannelError, ClusterError};
use lxcsmith::steps::{HookSurface, ProvisionHook, ShellHook};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn test_config(extra: &str) -> BuildConfig {
    BuildConfig::from_toml_str(&format!(
        r#"
        os_template = "local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst"
        hostname = "pipeline-test"
        {extra}

        [connection]
        url = "https://pve.example.org:8006"
        username = "root@pam"
        token = "builder=secret"
        node = "pve1"

        [rootfs]
        storage_id = "local-lvm"
        disk_size = "8G"
        "#
    ))
    .unwrap()
}

/// Records every cluster call; instances live in memory.
#[derive(Default)]
struct FakeCluster {
    calls: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_instance(
        &self,
        _spec: &InstanceSpec,
        instance: &InstanceRef,
    ) -> Result<(), ClusterError> {
        self.record(format!("create:{}", instance.id()));
        Ok(())
    }

    async fn lookup_by_id(&self, id: u32) -> Result<InstanceRef, ClusterError> {
        Err(ClusterError::NotFound {
            what: format!("vm '{id}'"),
        })
    }

    async fn lookup_by_hostname(&self, hostname: &str) -> Result<Vec<InstanceRef>, ClusterError> {
        Err(ClusterError::NotFound {
            what: format!("vm '{hostname}'"),
        })
    }

    async fn instance_config(
        &self,
        _instance: &InstanceRef,
    ) -> Result<serde_json::Map<String, Value>, ClusterError> {
        Ok(serde_json::Map::new())
    }

    async fn next_free_id(&self, _hint: u32) -> Result<u32, ClusterError> {
        self.record("next_free_id");
        Ok(105)
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        self.record(format!("start:{}", instance.id()));
        Ok(())
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        self.record(format!("stop:{}", instance.id()));
        Ok(())
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        self.record(format!("delete:{}", instance.id()));
        Ok(())
    }
}

/// Answers `lxc-info` introspection with an address and everything else
/// with a clean exit.
struct ScriptedTunnel {
    commands: Mutex<Vec<String>>,
}

impl ScriptedTunnel {
    fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tunnel for ScriptedTunnel {
    async fn start(&self, request: CommandRequest) -> Result<CommandHandle, ChannelError> {
        let output = if request.command.starts_with("lxc-info") {
            "10.0.0.5\n"
        } else {
            ""
        };
        self.commands.lock().unwrap().push(request.command);
        Ok(CommandHandle::completed(0, output))
    }

    async fn upload(&self, _dest: &str, _contents: &[u8]) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn upload_dir(
        &self,
        _dest: &str,
        _src: &str,
        _exclude: &[String],
    ) -> Result<(), ChannelError> {
        Ok(())
    }
}

struct FailingHook;

#[async_trait]
impl ProvisionHook for FailingHook {
    async fn run(&self, _surface: HookSurface<'_>, _metadata: &mut Value) -> anyhow::Result<()> {
        anyhow::bail!("provisioning engine failed")
    }
}

#[tokio::test]
async fn test_successful_build_keeps_the_instance() {
    let cluster = Arc::new(FakeCluster::default());
    let tunnel = Arc::new(ScriptedTunnel::new());
    let hook = Arc::new(ShellHook::new(vec![]));

    let builder = Builder::new(test_config(""), Arc::clone(&cluster) as _);
    let output = builder
        .run(hook, Some(Arc::clone(&tunnel) as _), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.instance.id(), 105);
    assert_eq!(output.generated["address"], "10.0.0.5");
    assert_eq!(output.generated["hostname"], "pipeline-test");

    let calls = cluster.calls();
    assert!(calls.contains(&"create:105".to_string()));
    // The success marker ran, so cleanup must not touch the instance.
    assert!(!calls.iter().any(|c| c.starts_with("stop:")));
    assert!(!calls.iter().any(|c| c.starts_with("delete:")));
}

#[tokio::test]
async fn test_failed_provisioning_deletes_the_instance() {
    let cluster = Arc::new(FakeCluster::default());
    let tunnel = Arc::new(ScriptedTunnel::new());

    let builder = Builder::new(test_config(""), Arc::clone(&cluster) as _);
    let err = builder
        .run(
            Arc::new(FailingHook),
            Some(Arc::clone(&tunnel) as _),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Provision(_)));
    let calls = cluster.calls();
    assert!(calls.contains(&"create:105".to_string()));
    assert!(calls.contains(&"stop:105".to_string()));
    assert!(calls.contains(&"delete:105".to_string()));
    // Unwind runs after the halt, in that order.
    let delete_pos = calls.iter().position(|c| c == "delete:105").unwrap();
    let create_pos = calls.iter().position(|c| c == "create:105").unwrap();
    assert!(create_pos < delete_pos);
}

#[tokio::test]
async fn test_provisioner_commands_travel_through_the_tunnel() {
    let cluster = Arc::new(FakeCluster::default());
    let tunnel = Arc::new(ScriptedTunnel::new());
    let hook = Arc::new(ShellHook::new(
        test_config(r#"provisioners = [{ inline = ["apt-get update"] }]"#).provisioners,
    ));

    let builder = Builder::new(
        test_config(r#"provisioners = [{ inline = ["apt-get update"] }]"#),
        Arc::clone(&cluster) as _,
    );
    builder
        .run(hook, Some(Arc::clone(&tunnel) as _), CancellationToken::new())
        .await
        .unwrap();

    let commands = tunnel.commands();
    assert!(
        commands.contains(&"pct exec 105 -- bash -c \"apt-get update\"".to_string()),
        "expected wrapped provisioner command, got {commands:?}"
    );
}

#[tokio::test]
async fn test_cancellation_before_start_creates_nothing() {
    let cluster = Arc::new(FakeCluster::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let builder = Builder::new(test_config(""), Arc::clone(&cluster) as _);
    let err = builder
        .run(Arc::new(ShellHook::new(vec![])), None, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(cluster.calls().is_empty());
}
