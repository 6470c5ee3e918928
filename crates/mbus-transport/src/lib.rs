//! Messaging bus host layer.
//!
//! Models the host a bus runs inside: a tree of nested contexts where a
//! context can only reach others through a one-way `post` addressed to a
//! channel it can see (its descendants, its parent chain, its opener).
//!
//! # Quick start
//!
//! ```rust
//! use mbus_transport::{ContextTree, HostEvent, TreeConfig};
//!
//! # async fn example() -> Result<(), mbus_transport::TransportError> {
//! let tree = ContextTree::new(TreeConfig::new());
//! let root = tree.open_root();
//! let mut child = tree.open_child(root.id())?;
//!
//! root.post(child.id(), serde_json::json!({"hello": "frame"}))?;
//!
//! if let Some(HostEvent::Inbound(inbound)) = child.next_event().await {
//!     assert_eq!(inbound.source, root.id());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod event;
mod node;
mod tree;

pub use config::TreeConfig;
pub use error::TransportError;
pub use event::{HostEvent, Inbound};
pub use node::ContextNode;
pub use tree::ContextTree;

use std::fmt;

/// Opaque reference to a context reachable through the host.
///
/// Two channels are equal only if they name the same context instance; a
/// context that is closed and reopened gets a fresh id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Build a channel id from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}
