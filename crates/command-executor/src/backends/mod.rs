//! Backend implementations for different execution contexts
//!
//! - [`local`]: spawn the command on this machine.
//! - [`ssh`]: wrap the command in an `ssh` invocation and delegate to an
//!   inner launcher.
//!
//! Custom backends implement [`Launcher`](crate::launcher::Launcher).

pub mod local;
pub use local::LocalLauncher;

pub mod ssh;
pub use ssh::{SshConfig, SshLauncher};
