//! Messaging bus protocol layer.
//!
//! Peer discovery, acknowledged messages, request/response and broadcasts
//! between bus instances living in nested contexts, on top of
//! `mbus-transport` (the in-memory context tree).
//!
//! Wire format: plain JSON objects tagged with a protocol marker.
//!
//! ```no_run
//! use mbus_protocol::{BusConfig, Callback, MessagingBus};
//! use mbus_transport::{ContextTree, TreeConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), mbus_protocol::BusError> {
//! let tree = ContextTree::new(TreeConfig::new());
//! let root = tree.open_root();
//! let frame = tree.open_child(root.id())?;
//!
//! let main = MessagingBus::spawn(root, BusConfig::new("main"));
//! let widget = MessagingBus::spawn(frame, BusConfig::new("widget"));
//!
//! widget
//!     .add_callback("ping", Callback::new(|_, _, _| json!({"pong": true}).into()))
//!     .await?;
//! let reply = main.send_request("widget", "ping", json!({})).await?;
//! assert_eq!(reply.response, json!({"pong": true}));
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod callbacks;
pub mod correlation;
pub mod debug;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod types;
pub mod wait;

pub use broadcast::{BroadcastOptions, BroadcastPolicy, RequestResult};
pub use callbacks::{Callback, CallbackRegistry, Reply};
pub use correlation::{CorrelationAllocator, PendingTable, ResponseMatch};
pub use debug::{DebugConfig, LogCategory};
pub use discovery::{Discovery, DiscoveryAction, DiscoveryEvent};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use error::BusError;
pub use registry::PeerRegistry;
pub use router::{Router, RoutingAction};
pub use runtime::{BusConfig, BusHandle, HostTree, MessagingBus, Transport};
pub use types::{
    is_truthy, ChannelId, CorrelationCode, Handle, InternalAction, RequestResponse,
    DEFAULT_HANDLE, PROTOCOL_MARKER,
};
pub use wait::{WaitOutcome, WaitRegistry};
