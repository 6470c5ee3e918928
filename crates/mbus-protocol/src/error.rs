use crate::types::{ChannelId, Handle};

/// Errors surfaced by the messaging bus.
///
/// Wraps host errors and adds the bus-level failures callers see from
/// sends, requests and broadcasts.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(#[from] mbus_transport::TransportError),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("no peer found with handle: {handle}")]
    UnknownHandle { handle: Handle },

    #[error("no peer registered on channel {channel}")]
    UnknownChannel { channel: ChannelId },

    #[error("request timed out: {action} to {handle}")]
    Timeout { handle: Handle, action: String },

    #[error("None of the handlers responded within the timeout period")]
    NoResponses,

    #[error("parent context has not registered")]
    ParentNotRegistered,

    #[error("action name is reserved: {action}")]
    ReservedAction { action: String },

    #[error("no free correlation code")]
    CodesExhausted,

    #[error("messaging bus shut down")]
    Shutdown,
}

impl BusError {
    /// Whether this failure is a request timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}
