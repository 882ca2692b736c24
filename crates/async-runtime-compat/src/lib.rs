//! Runtime-agnostic async utilities
//!
//! This crate provides the small set of runtime hooks the deployment control
//! plane needs without coupling its libraries to a specific executor:
//!
//! - [`Spawner`] for fire-and-forget background work (task bodies),
//! - [`sleep`](runtime_utils::sleep) for polling loops,
//! - [`Poller`](poll::Poller), a bounded retry primitive that still honours an
//!   optional outer deadline.
//!
//! # Examples
//!
//! ```no_run
//! use async_runtime_compat::prelude::*;
//!
//! async fn example<S: Spawner>(spawner: &S) {
//!     spawner.spawn(Box::pin(async {
//!         println!("Running in the background!");
//!     }));
//! }
//!
//! # #[cfg(feature = "smol")]
//! smol::block_on(async {
//!     example(&SmolSpawner).await;
//! });
//! ```

#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;

/// Boxed future accepted by [`Spawner::spawn`]
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawner that can spawn futures on an async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future will run to completion in the background. The caller never
    /// blocks and never observes the output.
    fn spawn(&self, future: BoxedTask);
}

impl<S: Spawner + ?Sized> Spawner for std::sync::Arc<S> {
    fn spawn(&self, future: BoxedTask) {
        (**self).spawn(future)
    }
}

#[cfg(feature = "smol")]
pub mod smol;

pub mod poll;
pub mod runtime_utils;

/// Prelude for common imports
pub mod prelude {
    pub use crate::poll::{Backoff, PollError, Poller, Probe};
    pub use crate::runtime_utils::sleep;
    pub use crate::{BoxedTask, Spawner};

    #[cfg(feature = "smol")]
    pub use crate::smol::SmolSpawner;
}

/// Create a spawner for the runtime selected at compile time
///
/// Returns `None` when no runtime feature is enabled.
pub fn default_spawner() -> Option<std::sync::Arc<dyn Spawner>> {
    #[cfg(feature = "smol")]
    let spawner: Option<std::sync::Arc<dyn Spawner>> =
        Some(std::sync::Arc::new(crate::smol::SmolSpawner));

    #[cfg(not(feature = "smol"))]
    let spawner = None;

    spawner
}
