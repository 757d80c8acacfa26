//! The build pipeline's steps, in execution order: create the instance,
//! open the command channel, resolve the instance address, run the
//! provisioning hook, record success.

pub mod address;
pub mod create;
pub mod open_channel;
pub mod provision;
pub mod success;

pub use address::ResolveAddressStep;
pub use create::CreateInstanceStep;
pub use open_channel::OpenChannelStep;
pub use provision::{HookSurface, ProvisionHook, ProvisionStep, ShellHook};
pub use success::SuccessStep;
