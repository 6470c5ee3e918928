use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::TreeConfig;
use crate::event::{HostEvent, Inbound};
use crate::node::ContextNode;
use crate::{ChannelId, TransportError};

/// Book-keeping for one context in the tree.
#[derive(Debug)]
struct ContextSlot {
    parent: Option<ChannelId>,
    opener: Option<ChannelId>,
    /// Live children, in creation order. Ordinals index into this list.
    children: Vec<ChannelId>,
    live: bool,
    /// Dropped once the context is torn down.
    inbox: Option<mpsc::UnboundedSender<HostEvent>>,
}

#[derive(Debug, Default)]
struct TreeInner {
    next_id: u64,
    contexts: HashMap<ChannelId, ContextSlot>,
}

/// The shared host: every context of a simulated page tree.
///
/// Cheap to clone; all clones see the same tree.
#[derive(Debug, Clone)]
pub struct ContextTree {
    inner: Arc<Mutex<TreeInner>>,
    config: TreeConfig,
}

impl ContextTree {
    pub fn new(config: TreeConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TreeInner::default())),
            config,
        }
    }

    /// Open a new top-level context.
    pub fn open_root(&self) -> ContextNode {
        self.open(None, None)
    }

    /// Open a context nested directly inside `parent`.
    pub fn open_child(&self, parent: ChannelId) -> Result<ContextNode, TransportError> {
        {
            let inner = self.inner.lock();
            let slot = inner
                .contexts
                .get(&parent)
                .ok_or(TransportError::UnknownChannel(parent))?;
            if !slot.live {
                return Err(TransportError::ChannelClosed(parent));
            }
            if depth_of(&inner, parent) + 1 > self.config.max_depth {
                return Err(TransportError::DepthExceeded {
                    max: self.config.max_depth,
                });
            }
        }
        Ok(self.open(Some(parent), None))
    }

    /// Open a new top-level context that remembers `opener` (a popup).
    pub fn open_popup(&self, opener: ChannelId) -> Result<ContextNode, TransportError> {
        {
            let inner = self.inner.lock();
            let slot = inner
                .contexts
                .get(&opener)
                .ok_or(TransportError::UnknownChannel(opener))?;
            if !slot.live {
                return Err(TransportError::ChannelClosed(opener));
            }
        }
        Ok(self.open(None, Some(opener)))
    }

    /// Tear a context down together with everything nested inside it.
    ///
    /// Each affected context receives [`HostEvent::Teardown`] after any
    /// values already queued for it, is detached from its parent and stops
    /// reporting itself as live.
    pub fn close(&self, channel: ChannelId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.contexts.contains_key(&channel) {
            return Err(TransportError::UnknownChannel(channel));
        }

        let mut doomed = vec![channel];
        let mut i = 0;
        while i < doomed.len() {
            if let Some(slot) = inner.contexts.get(&doomed[i]) {
                doomed.extend(slot.children.iter().copied());
            }
            i += 1;
        }

        if let Some(parent) = inner.contexts.get(&channel).and_then(|s| s.parent) {
            if let Some(parent_slot) = inner.contexts.get_mut(&parent) {
                parent_slot.children.retain(|c| *c != channel);
            }
        }

        for id in doomed {
            if let Some(slot) = inner.contexts.get_mut(&id) {
                slot.live = false;
                slot.children.clear();
                if let Some(inbox) = slot.inbox.take() {
                    let _ = inbox.send(HostEvent::Teardown);
                }
                tracing::debug!(channel = %id, "context torn down");
            }
        }
        Ok(())
    }

    /// Whether `channel` names a context that is still alive.
    pub fn is_live(&self, channel: ChannelId) -> bool {
        self.inner
            .lock()
            .contexts
            .get(&channel)
            .is_some_and(|s| s.live)
    }

    /// Directly nested live contexts of `channel`, in order.
    pub fn children(&self, channel: ChannelId) -> Vec<ChannelId> {
        self.inner
            .lock()
            .contexts
            .get(&channel)
            .map(|s| s.children.clone())
            .unwrap_or_default()
    }

    /// The context `channel` is nested in, if any.
    pub fn parent(&self, channel: ChannelId) -> Option<ChannelId> {
        self.inner.lock().contexts.get(&channel)?.parent
    }

    /// The top-level ancestor of `channel` (itself for a root).
    pub fn root_of(&self, channel: ChannelId) -> Option<ChannelId> {
        let inner = self.inner.lock();
        root_of(&inner, channel)
    }

    /// The root of the tree that opened `channel`, if `channel` is a popup.
    pub fn opener_root(&self, channel: ChannelId) -> Option<ChannelId> {
        let inner = self.inner.lock();
        let opener = inner.contexts.get(&channel)?.opener?;
        root_of(&inner, opener)
    }

    /// Post `data` from `from` to `to`.
    ///
    /// Values posted by one context to another arrive in posting order;
    /// nothing is promised across different senders.
    pub fn post(
        &self,
        from: ChannelId,
        to: ChannelId,
        data: serde_json::Value,
    ) -> Result<(), TransportError> {
        let size = serde_json::to_vec(&data)
            .map_err(TransportError::Serialization)?
            .len();
        if size > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }

        let inner = self.inner.lock();
        let slot = inner
            .contexts
            .get(&to)
            .ok_or(TransportError::UnknownChannel(to))?;
        let inbox = slot
            .inbox
            .as_ref()
            .filter(|_| slot.live)
            .ok_or(TransportError::ChannelClosed(to))?;
        inbox
            .send(HostEvent::Inbound(Inbound { source: from, data }))
            .map_err(|_| TransportError::ChannelClosed(to))
    }

    /// Number of contexts still alive.
    pub fn live_count(&self) -> usize {
        self.inner.lock().contexts.values().filter(|s| s.live).count()
    }

    fn open(&self, parent: Option<ChannelId>, opener: Option<ChannelId>) -> ContextNode {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ChannelId::from_raw(inner.next_id);

        inner.contexts.insert(
            id,
            ContextSlot {
                parent,
                opener,
                children: Vec::new(),
                live: true,
                inbox: Some(tx),
            },
        );
        if let Some(parent) = parent {
            if let Some(parent_slot) = inner.contexts.get_mut(&parent) {
                parent_slot.children.push(id);
            }
        }
        drop(inner);

        tracing::debug!(channel = %id, ?parent, ?opener, "context opened");
        ContextNode::new(id, self.clone(), rx)
    }
}

fn root_of(inner: &TreeInner, channel: ChannelId) -> Option<ChannelId> {
    let mut current = channel;
    loop {
        match inner.contexts.get(&current)?.parent {
            Some(parent) => current = parent,
            None => return Some(current),
        }
    }
}

fn depth_of(inner: &TreeInner, channel: ChannelId) -> usize {
    let mut depth = 0;
    let mut current = channel;
    while let Some(parent) = inner.contexts.get(&current).and_then(|s| s.parent) {
        depth += 1;
        current = parent;
    }
    depth
}
