use thiserror::Error;

/// Errors raised while fetching or decoding an upstream realtime feed.
///
/// These never reach query callers: a failed poll keeps the previous
/// snapshot authoritative and is retried on the source's own schedule.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Network error: {0}")]
    NetworkMessage(String),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

impl FeedError {
    /// Whether this failure is worth retrying at all. Currently every feed
    /// failure is treated as transient: providers recover, and a decode
    /// failure on one cycle may be a truncated response.
    pub fn is_transient(&self) -> bool {
        true
    }
}
