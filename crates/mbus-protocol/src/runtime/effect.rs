use mbus_transport::TransportError;
use serde_json::Value;

use crate::callbacks::Callback;
use crate::envelope::Envelope;
use crate::types::{ChannelId, CorrelationCode, Handle};

/// Intent produced by the pure logic of `BusState`.
///
/// Every handle_* / tick_* method returns `Vec<BusEffect>`. The loop then
/// carries them out against the host and the application callbacks.
#[derive(Debug)]
pub(crate) enum BusEffect {
    /// Post an envelope to a channel.
    Post { target: ChannelId, envelope: Envelope },

    /// Run every callback bound to a message's action. Deferred replies
    /// are spawned and their results dropped.
    Invoke {
        callbacks: Vec<Callback>,
        action: String,
        payload: Value,
        from: Handle,
    },

    /// Run the single callback bound to a request's action and answer
    /// with what it returns.
    Respond {
        callback: Callback,
        action: String,
        payload: Value,
        from: Handle,
        code: CorrelationCode,
    },
}

/// A callback's answer on its way back to the loop.
#[derive(Debug)]
pub(crate) struct Responder {
    pub to: Handle,
    pub action: String,
    pub payload: Value,
    pub code: CorrelationCode,
}

/// A post the host refused.
#[derive(Debug)]
pub(crate) struct PostFailure {
    pub target: ChannelId,
    pub envelope: Envelope,
    pub error: TransportError,
}
