use tokio::sync::mpsc;

use crate::event::HostEvent;
use crate::tree::ContextTree;
use crate::{ChannelId, TransportError};

/// One context's view of the host: post, look around, receive.
///
/// This is what a bus instance owns. Everything it can see is relative to
/// its own position in the tree.
#[derive(Debug)]
pub struct ContextNode {
    id: ChannelId,
    tree: ContextTree,
    events: mpsc::UnboundedReceiver<HostEvent>,
}

impl ContextNode {
    pub(crate) fn new(
        id: ChannelId,
        tree: ContextTree,
        events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> Self {
        Self { id, tree, events }
    }

    /// This context's channel.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The tree this context lives in.
    pub fn tree(&self) -> &ContextTree {
        &self.tree
    }

    /// Post a value to another context.
    pub fn post(&self, to: ChannelId, data: serde_json::Value) -> Result<(), TransportError> {
        self.tree.post(self.id, to, data)
    }

    /// Directly nested contexts of `channel`, in order.
    pub fn children(&self, channel: ChannelId) -> Vec<ChannelId> {
        self.tree.children(channel)
    }

    /// The context this one is nested in.
    pub fn parent(&self) -> Option<ChannelId> {
        self.tree.parent(self.id)
    }

    /// The top-level context of this context's tree.
    pub fn own_root(&self) -> Option<ChannelId> {
        self.tree.root_of(self.id)
    }

    /// The root of the opener's tree, if this context is a popup.
    pub fn opener_root(&self) -> Option<ChannelId> {
        self.tree.opener_root(self.id)
    }

    /// Whether `channel` is still a live context.
    pub fn is_live(&self, channel: ChannelId) -> bool {
        self.tree.is_live(channel)
    }

    /// Wait for the next host event. Returns `None` after teardown.
    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }
}
