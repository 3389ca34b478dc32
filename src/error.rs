use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the sibyl library.
///
/// Transient provider failures are retried with bounded backoff inside the
/// providers themselves; `ProviderUnavailable` means every retry was spent.
/// `DimensionMismatch` and `IndexModelMismatch` are configuration faults and
/// are never retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{provider} provider unavailable: {message}")]
    ProviderUnavailable {
        provider: &'static str,
        message: String,
    },

    #[error("vector dimension mismatch: index expects {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(
        "index '{name}' was built with model '{index_model}' ({index_dims} dims) \
         but the active embedder is '{active_model}' ({active_dims} dims)"
    )]
    IndexModelMismatch {
        name: String,
        index_model: String,
        index_dims: usize,
        active_model: String,
        active_dims: usize,
    },

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("query cancelled: step receiver dropped")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
