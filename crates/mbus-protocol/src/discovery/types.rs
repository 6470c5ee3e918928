/// Discovery payloads and outcomes.
///
/// These travel inside internal envelopes; field names follow the wire
/// format other buses expect.
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{ChannelId, Handle};

// ── Payloads ─────────────────────────────────────────────────────────────

/// Registration: "I am here". `is_child` is set when the recipient is the
/// sender's direct parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(default)]
    pub is_child: bool,
}

/// Deregistration: the sender is going away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterPayload {
    #[serde(default)]
    pub destroyed: bool,
}

/// Distribution: ordinals into the sender's children the recipient should
/// register with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributePayload {
    #[serde(default)]
    pub is_descendent: bool,
    pub windows: Vec<usize>,
}

// ── Outcomes ─────────────────────────────────────────────────────────────

/// Registry changes the application hears about through callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Registered(Handle),
    Deregistered(Handle),
}

/// What the discovery engine wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryAction {
    /// Post an envelope straight to a channel.
    Post { target: ChannelId, envelope: Envelope },
    /// Once `via` resolves to a channel, register with the children of
    /// that channel at `ordinals`.
    Relay { via: Handle, ordinals: Vec<usize> },
    /// Tell the application.
    Event(DiscoveryEvent),
}
