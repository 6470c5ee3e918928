/// Envelope routing for the messaging bus.
///
/// Pure decision logic: receives a decoded envelope and the channel it came
/// from, returns a `RoutingAction` telling the runtime what to do (run
/// discovery, settle an ack or response, dispatch to callbacks, reject,
/// drop). No I/O.
use serde_json::Value;

use crate::envelope::Envelope;
use crate::registry::PeerRegistry;
use crate::types::{ChannelId, CorrelationCode, Handle, InternalAction};

// ── Routing decisions ──────────────────────────────────────────────────

/// What to do with an incoming envelope.
#[derive(Debug, PartialEq)]
pub enum RoutingAction {
    /// Discovery traffic. Bypasses recipient and sender checks.
    Internal {
        action: InternalAction,
        envelope: Envelope,
    },
    /// Acknowledgement of one of our messages.
    Ack { code: CorrelationCode, from: Handle },
    /// Response to one of our requests.
    Response {
        code: CorrelationCode,
        from: Handle,
        action: String,
        payload: Value,
    },
    /// Request for our callbacks; one of them must answer under `code`.
    Request {
        from: Handle,
        action: String,
        payload: Value,
        code: CorrelationCode,
    },
    /// Plain message for our callbacks, to be acknowledged if `ack_code`
    /// is set.
    Deliver {
        from: Handle,
        action: String,
        payload: Value,
        ack_code: Option<CorrelationCode>,
    },
    /// Looks like ours but must not be trusted (wrong channel, malformed).
    Reject { reason: String },
    /// Not addressed to us: silently ignore.
    Drop,
}

// ── Router ─────────────────────────────────────────────────────────────

/// Call `route()` with an incoming envelope, act on the returned
/// `RoutingAction`.
pub struct Router {
    local: Handle,
}

impl Router {
    pub fn new(local: Handle) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &Handle {
        &self.local
    }

    /// Classify an envelope that arrived on `source`.
    ///
    /// Non-internal traffic must name us as recipient and come from the
    /// channel its sender registered on.
    pub fn route(
        &self,
        registry: &PeerRegistry,
        source: ChannelId,
        envelope: Envelope,
    ) -> RoutingAction {
        if let Some(action) = envelope.internal_action() {
            return RoutingAction::Internal { action, envelope };
        }

        if envelope.to.as_ref() != Some(&self.local) {
            return RoutingAction::Drop;
        }

        if registry.channel(envelope.from.as_str()) != Some(source) {
            return RoutingAction::Reject {
                reason: format!(
                    "envelope claiming to be from {} arrived on unregistered channel {source}",
                    envelope.from
                ),
            };
        }

        if envelope.is_ack {
            return match envelope.ack_code {
                Some(code) => RoutingAction::Ack {
                    code,
                    from: envelope.from,
                },
                None => RoutingAction::Drop,
            };
        }

        if envelope.is_response {
            return match envelope.response_code {
                Some(code) => RoutingAction::Response {
                    code,
                    from: envelope.from,
                    action: envelope.action,
                    payload: envelope.payload,
                },
                None => RoutingAction::Reject {
                    reason: format!("response from {} without a code", envelope.from),
                },
            };
        }

        if envelope.expects_response {
            return match envelope.response_code {
                Some(code) => RoutingAction::Request {
                    from: envelope.from,
                    action: envelope.action,
                    payload: envelope.payload,
                    code,
                },
                None => RoutingAction::Reject {
                    reason: format!("request from {} without a code", envelope.from),
                },
            };
        }

        RoutingAction::Deliver {
            from: envelope.from,
            action: envelope.action,
            payload: envelope.payload,
            ack_code: envelope.ack_code,
        }
    }
}
