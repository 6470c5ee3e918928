use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use mbus_transport::ChannelId;

/// Marker carried in `_source` by every bus envelope.
///
/// Anything posted to a context without it belongs to someone else and is
/// ignored.
pub const PROTOCOL_MARKER: &str = "__MessagingBus__";

/// Prefix turning a request action into its response action.
pub const RESPONSE_PREFIX: &str = "RESPONSE_";

/// Action fired locally when a peer registers.
pub const REGISTERED_ACTION: &str = "registered";

/// Action fired locally when a peer deregisters.
pub const DEREGISTERED_ACTION: &str = "deregistered";

/// Handle used when none is configured.
pub const DEFAULT_HANDLE: &str = "main";

/// Correlation codes are drawn uniformly from `1..CODE_SPACE`.
pub const CODE_SPACE: u32 = 100_000;

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long an operation waits for an unknown handle to register.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a broadcast waits when no peer is known yet.
pub const DEFAULT_BROADCAST_SETTLE: Duration = Duration::from_millis(500);

/// Cadence at which pending waits are re-checked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(4);

/// Correlation code pairing an ack or response with what caused it.
pub type CorrelationCode = u32;

// ── Handle ────────────────────────────────────────────────────────────

/// Name a bus instance is known by. Unique per bus among its peers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Handle> for Handle {
    fn from(h: &Handle) -> Self {
        h.clone()
    }
}

impl Borrow<str> for Handle {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Handle {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Handle {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ── Internal actions ──────────────────────────────────────────────────

/// Discovery actions exchanged between buses. Never reach callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalAction {
    Registration,
    Deregistration,
    Distribution,
}

impl InternalAction {
    pub const ALL: [InternalAction; 3] = [
        InternalAction::Registration,
        InternalAction::Deregistration,
        InternalAction::Distribution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InternalAction::Registration => "__INTERNAL_MESSAGING_REGISTRATION",
            InternalAction::Deregistration => "__INTERNAL_MESSAGING_DEREGISTRATION",
            InternalAction::Distribution => "__INTERNAL_MESSAGING_DISTRIBUTION",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == action)
    }
}

impl fmt::Display for InternalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action a response to `action` is sent under.
pub fn response_action(action: &str) -> String {
    format!("{RESPONSE_PREFIX}{action}")
}

/// Names applications may not send under: discovery actions and anything
/// that looks like a response.
pub fn is_reserved_action(action: &str) -> bool {
    InternalAction::from_action(action).is_some() || action.starts_with(RESPONSE_PREFIX)
}

/// Loose truthiness used to decide whether a callback actually answered.
///
/// `null`, `false`, `0`, `NaN` and `""` are falsy. Arrays and objects are
/// truthy even when empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ── Request outcome ───────────────────────────────────────────────────

/// A successful request: what came back, and from whom.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResponse {
    pub response: Value,
    pub handle: Handle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handle_serializes_as_plain_string() {
        let h = Handle::from("B");
        assert_eq!(serde_json::to_value(&h).unwrap(), json!("B"));
        let back: Handle = serde_json::from_value(json!("B")).unwrap();
        assert_eq!(back, h);
        assert_eq!(format!("{h:?}"), "Handle(B)");
    }

    #[test]
    fn internal_action_roundtrip_names() {
        for a in InternalAction::ALL {
            assert_eq!(InternalAction::from_action(a.as_str()), Some(a));
        }
        assert_eq!(InternalAction::from_action("ping"), None);
    }

    #[test]
    fn reserved_actions() {
        assert!(is_reserved_action("__INTERNAL_MESSAGING_REGISTRATION"));
        assert!(is_reserved_action("RESPONSE_ping"));
        assert!(!is_reserved_action("ping"));
        assert!(!is_reserved_action("registered"));
    }

    #[test]
    fn response_action_prefix() {
        assert_eq!(response_action("ping"), "RESPONSE_ping");
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(-3.5)));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }
}
