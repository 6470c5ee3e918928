use mbus_transport::{HostEvent, TransportError};
use serde_json::Value;

use crate::types::ChannelId;

/// What a bus can see of the context tree around it.
///
/// Queries are synchronous and reflect the tree at the moment they are
/// made; discovery and the peer registry only ever ask, never cache.
pub trait HostTree {
    /// The channel of the context this bus lives in.
    fn local(&self) -> ChannelId;

    /// Directly nested live contexts of `channel`, in order.
    fn children(&self, channel: ChannelId) -> Vec<ChannelId>;

    /// The context the local one is nested in.
    fn parent(&self) -> Option<ChannelId>;

    /// The top-level context of the local tree.
    fn own_root(&self) -> Option<ChannelId>;

    /// The root of the opener's tree when the local context is a popup.
    fn opener_root(&self) -> Option<ChannelId>;

    /// Whether `channel` is still alive.
    fn is_live(&self, channel: ChannelId) -> bool;
}

/// Host abstraction for the runtime.
///
/// In production: implemented by `ContextNode` (the in-memory host).
/// In tests: implemented by `MockHost` (records posts).
#[async_trait::async_trait]
pub trait Transport: HostTree + Send {
    /// Post a value to another context.
    fn post(&self, target: ChannelId, data: Value) -> Result<(), TransportError>;

    /// Wait for the next host event. `None` once the context is gone.
    async fn next_event(&mut self) -> Option<HostEvent>;
}

// ── Impl for ContextNode ────────────────────────────────────────────

impl HostTree for mbus_transport::ContextNode {
    fn local(&self) -> ChannelId {
        self.id()
    }

    fn children(&self, channel: ChannelId) -> Vec<ChannelId> {
        mbus_transport::ContextNode::children(self, channel)
    }

    fn parent(&self) -> Option<ChannelId> {
        mbus_transport::ContextNode::parent(self)
    }

    fn own_root(&self) -> Option<ChannelId> {
        mbus_transport::ContextNode::own_root(self)
    }

    fn opener_root(&self) -> Option<ChannelId> {
        mbus_transport::ContextNode::opener_root(self)
    }

    fn is_live(&self, channel: ChannelId) -> bool {
        mbus_transport::ContextNode::is_live(self, channel)
    }
}

#[async_trait::async_trait]
impl Transport for mbus_transport::ContextNode {
    fn post(&self, target: ChannelId, data: Value) -> Result<(), TransportError> {
        mbus_transport::ContextNode::post(self, target, data)
    }

    async fn next_event(&mut self) -> Option<HostEvent> {
        mbus_transport::ContextNode::next_event(self).await
    }
}

// ── MockHost (tests) ────────────────────────────────────────────────
