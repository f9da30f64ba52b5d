//! Top-level error type aggregating the crate's collaborators.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] kache_types::CacheError),

    #[error("upstream request failed: {0}")]
    Upstream(BoxError),
}

pub type Result<T> = std::result::Result<T, Error>;
