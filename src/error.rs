//! Aggregated error type for callers that only need one `Result` alias
//! across subsystem boundaries, the way `radicle-node`'s binaries consume
//! `anyhow::Error` while individual modules keep precise `thiserror` enums.
use thiserror::Error;

use crate::{discovery, dispatch, envelope, neighbor, routes, runtime};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Neighbor(#[from] neighbor::Error),

    #[error(transparent)]
    Envelope(#[from] envelope::Error),

    #[error(transparent)]
    Routes(#[from] routes::Error),

    #[error(transparent)]
    Discovery(#[from] discovery::Error),

    #[error(transparent)]
    Dispatch(#[from] dispatch::Error),

    #[error(transparent)]
    Runtime(#[from] runtime::Error),
}
