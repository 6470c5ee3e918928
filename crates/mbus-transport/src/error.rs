use crate::ChannelId;

/// Errors returned by the host layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("nesting depth exceeded (max {max})")]
    DepthExceeded { max: usize },
}
