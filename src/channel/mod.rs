//! The command channel: one remote-execution contract over two transports.
//!
//! Commands addressed to the instance are wrapped as
//! `pct exec <id> -- bash -c "<command>"` and either forwarded verbatim
//! through an already-open tunnel session or run locally under `/bin/sh -c`.
//! Starting a command never blocks; its result is observed exactly once by
//! consuming the returned handle.

pub mod local;
pub mod tunnel;

pub use tunnel::Tunnel;

use crate::cluster::InstanceRef;
use crate::errors::ChannelError;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

/// A command to run plus its attached input.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Completion of a started command: exit status plus captured output.
#[derive(Debug)]
pub struct CommandResult {
    pub exit_code: i32,
    output: Vec<u8>,
}

impl CommandResult {
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn output_utf8(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Observer for an in-flight command. `wait` consumes the handle, so the
/// result is observable exactly once.
pub struct CommandHandle {
    exit_rx: oneshot::Receiver<i32>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl CommandHandle {
    pub(crate) fn new(exit_rx: oneshot::Receiver<i32>, output: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { exit_rx, output }
    }

    /// A handle whose result is already known. Tunnel implementations that
    /// run commands synchronously use this to satisfy the async contract.
    pub fn completed(exit_code: i32, output: impl Into<Vec<u8>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(exit_code);
        Self {
            exit_rx: rx,
            output: Arc::new(Mutex::new(output.into())),
        }
    }

    /// Suspend until the underlying process or session completes.
    pub async fn wait(self) -> Result<CommandResult, ChannelError> {
        let exit_code = self
            .exit_rx
            .await
            .map_err(|_| ChannelError::ResultDropped)?;
        let output = std::mem::take(&mut *self.output.lock().await);
        Ok(CommandResult { exit_code, output })
    }
}

enum Transport {
    Local,
    Tunneled(Arc<dyn Tunnel>),
}

/// Executes commands "inside" the target instance, uniformly across both
/// transports.
pub struct CommandChannel {
    instance: InstanceRef,
    pct_cmd: String,
    transport: Transport,
}

impl CommandChannel {
    /// A channel that drives the instance from the cluster host itself.
    pub fn local(instance: InstanceRef, pct_cmd: impl Into<String>) -> Self {
        Self {
            instance,
            pct_cmd: pct_cmd.into(),
            transport: Transport::Local,
        }
    }

    /// A channel that forwards everything through an open tunnel session.
    pub fn tunneled(
        instance: InstanceRef,
        pct_cmd: impl Into<String>,
        tunnel: Arc<dyn Tunnel>,
    ) -> Self {
        Self {
            instance,
            pct_cmd: pct_cmd.into(),
            transport: Transport::Tunneled(tunnel),
        }
    }

    pub fn instance(&self) -> &InstanceRef {
        &self.instance
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self.transport, Transport::Tunneled(_))
    }

    /// The in-instance form of a command: the exec helper enters the
    /// instance and hands the command to a shell.
    pub fn wrap_command(&self, command: &str) -> String {
        format!(
            "{} exec {} -- bash -c \"{}\"",
            self.pct_cmd,
            self.instance.id(),
            command
        )
    }

    /// Start `request` inside the instance. Non-blocking; the caller
    /// observes completion through the returned handle.
    pub async fn start(&self, request: CommandRequest) -> Result<CommandHandle, ChannelError> {
        let wrapped = CommandRequest {
            command: self.wrap_command(&request.command),
            stdin: request.stdin,
        };
        self.dispatch(wrapped).await
    }

    /// Start a command inside the instance and block until it exits.
    /// A nonzero exit status surfaces as an error.
    pub async fn exec(&self, command: &str) -> Result<CommandResult, ChannelError> {
        let handle = self.start(CommandRequest::new(command)).await?;
        Self::finish(handle).await
    }

    /// Run an instance-management command on the cluster host, unwrapped.
    /// This is the path for the exec helper's own subcommands (`pct push`)
    /// and host-side introspection of the instance.
    pub async fn exec_host(&self, command: &str) -> Result<CommandResult, ChannelError> {
        let handle = self.dispatch(CommandRequest::new(command)).await?;
        Self::finish(handle).await
    }

    /// Upload a file into the instance.
    ///
    /// Tunneled: the tunnel lands the file on the intermediate host, then
    /// the exec helper pushes it the rest of the way. Local: the contents
    /// are staged to a temporary file that is removed on every exit path.
    pub async fn upload(&self, dest: &str, contents: &[u8]) -> Result<(), ChannelError> {
        let src = match &self.transport {
            Transport::Tunneled(tunnel) => {
                debug!(dest, "uploading via the tunnel session");
                tunnel.upload(dest, contents).await?;
                dest.to_string()
            }
            Transport::Local => {
                let staged = tempfile::NamedTempFile::new().map_err(ChannelError::Staging)?;
                std::io::Write::write_all(&mut staged.as_file(), contents)
                    .map_err(ChannelError::Staging)?;
                let path = staged.path().to_string_lossy().into_owned();
                let push = format!("{} push {} {} {}", self.pct_cmd, self.instance.id(), path, dest);
                self.exec_host(&push).await?;
                // `staged` dropped here removes the temp file.
                return Ok(());
            }
        };

        let push = format!("{} push {} {} {}", self.pct_cmd, self.instance.id(), src, dest);
        self.exec_host(&push).await?;
        Ok(())
    }

    /// Upload a directory tree into the instance, then walk the landed tree
    /// to confirm the transfer.
    pub async fn upload_dir(
        &self,
        dest: &str,
        src: &str,
        exclude: &[String],
    ) -> Result<(), ChannelError> {
        let target = match &self.transport {
            Transport::Tunneled(tunnel) => {
                debug!(dest, src, "uploading directory via the tunnel session");
                tunnel.upload_dir(dest, src, exclude).await?;
                // A trailing-slash source means the contents of `src` were
                // landed inside `dest`, so the target is `dest` either way.
                dest.to_string()
            }
            Transport::Local => src.to_string(),
        };

        let walk = format!(
            "find {target} -print0 | while IFS=' ' read -r -d '' file; do echo \"$file\"; done"
        );
        self.exec_host(&walk).await?;
        Ok(())
    }

    pub async fn download(&self, _src: &str) -> Result<Vec<u8>, ChannelError> {
        Err(ChannelError::Unsupported {
            operation: "download",
        })
    }

    pub async fn download_dir(&self, _src: &str, _dest: &str) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported {
            operation: "download_dir",
        })
    }

    async fn dispatch(&self, request: CommandRequest) -> Result<CommandHandle, ChannelError> {
        match &self.transport {
            Transport::Tunneled(tunnel) => {
                debug!(command = %request.command, "forwarding command through tunnel");
                tunnel.start(request).await
            }
            Transport::Local => local::spawn(request).await,
        }
    }

    async fn finish(handle: CommandHandle) -> Result<CommandResult, ChannelError> {
        let result = handle.wait().await?;
        if result.exit_code != 0 {
            return Err(ChannelError::NonZeroExit {
                code: result.exit_code,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records every forwarded command and upload; commands complete with a
    /// scripted exit code and output.
    struct RecordingTunnel {
        commands: StdMutex<Vec<String>>,
        uploads: StdMutex<Vec<(String, Vec<u8>)>>,
        exit_code: i32,
        output: &'static str,
    }

    impl RecordingTunnel {
        fn new() -> Self {
            Self::with_result(0, "")
        }

        fn with_result(exit_code: i32, output: &'static str) -> Self {
            Self {
                commands: StdMutex::new(Vec::new()),
                uploads: StdMutex::new(Vec::new()),
                exit_code,
                output,
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Tunnel for RecordingTunnel {
        async fn start(&self, request: CommandRequest) -> Result<CommandHandle, ChannelError> {
            self.commands.lock().unwrap().push(request.command);
            Ok(CommandHandle::completed(self.exit_code, self.output))
        }

        async fn upload(&self, dest: &str, contents: &[u8]) -> Result<(), ChannelError> {
            self.uploads
                .lock()
                .unwrap()
                .push((dest.to_string(), contents.to_vec()));
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

    fn instance() -> InstanceRef {
        InstanceRef::new(101, "pve1")
    }

    #[test]
    fn test_wrap_command_format() {
        let channel = CommandChannel::local(instance(), "pct");
        assert_eq!(
            channel.wrap_command("echo hello"),
            "pct exec 101 -- bash -c \"echo hello\""
        );
    }

    #[tokio::test]
    async fn test_tunneled_start_forwards_wrapped_command_verbatim() {
        let tunnel = Arc::new(RecordingTunnel::new());
        let channel = CommandChannel::tunneled(instance(), "pct", Arc::clone(&tunnel) as _);
        let handle = channel.start(CommandRequest::new("uname -a")).await.unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(
            tunnel.commands(),
            vec!["pct exec 101 -- bash -c \"uname -a\"".to_string()]
        );
    }

    #[tokio::test]
    async fn test_exec_surfaces_nonzero_exit() {
        let tunnel = Arc::new(RecordingTunnel::with_result(2, ""));
        let channel = CommandChannel::tunneled(instance(), "pct", tunnel as _);
        let err = channel.exec("false").await.unwrap_err();
        assert!(matches!(err, ChannelError::NonZeroExit { code: 2 }));
    }

    #[tokio::test]
    async fn test_exec_host_does_not_wrap() {
        let tunnel = Arc::new(RecordingTunnel::new());
        let channel = CommandChannel::tunneled(instance(), "pct", Arc::clone(&tunnel) as _);
        channel.exec_host("lxc-info -n 101 -i -H").await.unwrap();
        assert_eq!(tunnel.commands(), vec!["lxc-info -n 101 -i -H".to_string()]);
    }

    #[tokio::test]
    async fn test_tunneled_upload_then_push() {
        let tunnel = Arc::new(RecordingTunnel::new());
        let channel = CommandChannel::tunneled(instance(), "pct", Arc::clone(&tunnel) as _);
        channel.upload("/opt/setup.sh", b"#!/bin/sh\n").await.unwrap();

        let uploads = tunnel.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "/opt/setup.sh");
        // The just-uploaded path is pushed again into the instance.
        assert_eq!(
            tunnel.commands(),
            vec!["pct push 101 /opt/setup.sh /opt/setup.sh".to_string()]
        );
    }

    #[tokio::test]
    async fn test_local_upload_stages_and_pushes() {
        // `echo` stands in for the exec helper so the push becomes a no-op
        // host command that exits 0.
        let channel = CommandChannel::local(instance(), "echo");
        channel.upload("/etc/motd", b"welcome").await.unwrap();
    }

    #[tokio::test]
    async fn test_download_is_unsupported() {
        let channel = CommandChannel::local(instance(), "pct");
        let err = channel.download("/etc/os-release").await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Unsupported {
                operation: "download"
            }
        ));
    }

    #[tokio::test]
    async fn test_result_observable_exactly_once() {
        let handle = CommandHandle::completed(0, "one-shot");
        let result = handle.wait().await.unwrap();
        assert_eq!(result.output_utf8(), "one-shot");
        // `wait` consumed the handle; a second observation cannot compile,
        // which is the contract.
    }
}
