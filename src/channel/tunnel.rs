//! Tunnel transport seam.
//!
//! A `Tunnel` is an already-open remote session onto the cluster host (for
//! example an SSH session established by the caller). The command channel
//! forwards wrapped commands through it verbatim and uses its transfer
//! mechanism for uploads; session setup itself is the caller's concern.

use crate::channel::{CommandHandle, CommandRequest};
use crate::errors::ChannelError;
use async_trait::async_trait;

#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Start a command on the session's host. Must not block on completion;
    /// the returned handle observes the result asynchronously.
    async fn start(&self, request: CommandRequest) -> Result<CommandHandle, ChannelError>;

    /// Transfer a file onto the session's host.
    ///
    /// The file lands on the intermediate host, not inside the instance;
    /// the channel pushes it the rest of the way.
    async fn upload(&self, dest: &str, contents: &[u8]) -> Result<(), ChannelError>;

    /// Transfer a directory tree onto the session's host.
    async fn upload_dir(
        &self,
        dest: &str,
        src: &str,
        exclude: &[String],
    ) -> Result<(), ChannelError>;
}
