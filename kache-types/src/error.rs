use thiserror::Error;

/// Errors surfaced by the kache data model and storage contract.
///
/// Per the core's graceful-degradation policy, most of these are caught by
/// callers and downgraded to a cache miss rather than propagated to the client.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The stored entry bytes could not be decoded; treat as a miss.
    #[error("failed to decode cache entry: {0}")]
    Decode(#[from] bincode::Error),

    /// A header value was not valid UTF-8 or otherwise malformed.
    #[error("invalid header value: {0}")]
    BadHeader(#[from] http::header::ToStrError),

    #[error("invalid header name: {0}")]
    BadHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid header value: {0}")]
    BadHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("invalid status code: {0}")]
    BadStatus(#[from] http::status::InvalidStatusCode),

    /// The backing store is unreachable; reads degrade to a miss, writes fail.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An async store job could not be enqueued because the queue is saturated.
    #[error("store queue is full")]
    QueueFull,

    /// A value exceeded the configured per-item size limit.
    #[error("item exceeds max item size ({0} bytes)")]
    ItemTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, CacheError>;
