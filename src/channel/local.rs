//! Local process transport.
//!
//! Used when the build is driven from the cluster host itself: the wrapped
//! command runs under `/bin/sh -c`, with output captured and the exit code
//! forwarded asynchronously through the command handle.

use crate::channel::{CommandHandle, CommandRequest};
use crate::errors::ChannelError;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

/// Spawn `request.command` locally. Returns immediately; completion is
/// observed through the returned handle.
pub(crate) async fn spawn(request: CommandRequest) -> Result<CommandHandle, ChannelError> {
    debug!(command = %request.command, "starting command locally");

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&request.command)
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(ChannelError::Spawn)?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let (exit_tx, exit_rx) = oneshot::channel();

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let sink = Arc::clone(&output);
    let command_line = request.command.clone();

    tokio::spawn(async move {
        if let (Some(mut pipe), Some(bytes)) = (stdin, request.stdin) {
            let _ = pipe.write_all(&bytes).await;
            let _ = pipe.shutdown().await;
        }

        tokio::join!(
            drain(stdout, Arc::clone(&sink)),
            drain(stderr, Arc::clone(&sink)),
        );

        // The native exit code is unavailable when the process dies to a
        // signal; a generic nonzero code stands in.
        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        };
        debug!(exit_code, command = %command_line, "local command exited");
        let _ = exit_tx.send(exit_code);
    });

    Ok(CommandHandle::new(exit_rx, output))
}

async fn drain<R>(reader: Option<R>, sink: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.extend_from_slice(&buf[..n]),
        }
    }
}
