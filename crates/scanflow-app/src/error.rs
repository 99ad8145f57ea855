//! Application-level error type shared across subcommands.

use thiserror::Error;

use crate::cleanup::CleanupError;
use crate::config::AppConfigError;
use crate::dispatch::DispatchError;
use crate::discovery::DiscoveryError;
use crate::meta::MetaError;
use crate::paths::PathError;
use crate::state::MarkerError;
use crate::tables::TableError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),

    #[error(transparent)]
    Paths(#[from] PathError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}
