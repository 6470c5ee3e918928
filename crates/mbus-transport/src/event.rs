use crate::ChannelId;

/// A value posted to this context by another one.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The context that posted the value.
    pub source: ChannelId,
    /// The posted value, untouched by the host.
    pub data: serde_json::Value,
}

/// Everything a context can observe from its host.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A value arrived.
    Inbound(Inbound),
    /// The context is being torn down. No further events follow.
    Teardown,
}
