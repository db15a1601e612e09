use thiserror::Error;

/// Unified error type for applications built on Gotong.
///
/// Aggregates errors from the sub-crates into a single type for
/// application-level error handling, such as node bootstrap code.
#[derive(Error, Debug)]
pub enum GotongError {
    /// Error surfaced by a cluster operation.
    #[error("Cluster error: {0}")]
    Cluster(#[from] gotong_core::ClusterError),

    /// Error related to the shared key/value store.
    #[error("Shared store error: {0}")]
    Store(#[from] gotong_lease::StoreError),

    /// Error related to network operations.
    #[error("Network error: {0}")]
    Network(#[from] gotong_logistics::NetError),

    /// Telemetry could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Standard IO error.
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}
