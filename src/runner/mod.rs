//! In-process worker pools.

#[allow(clippy::module_inception)]
mod runner;
mod worker;

pub use runner::{Runner, RunnerBuilder, RunnerHandle};
pub use worker::Worker;

use thiserror::Error;

use crate::store::StoreError;

/// Error type for runner lifecycle operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("runner task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
