use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BusError;
use crate::types::{
    response_action, CorrelationCode, Handle, InternalAction, PROTOCOL_MARKER,
};

/// The unit of communication between buses.
///
/// Travels as a plain JSON object so the host never needs to know about
/// it. `_source` must equal [`PROTOCOL_MARKER`]; everything else posted to
/// a context is foreign traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Protocol marker.
    #[serde(rename = "_source")]
    pub source: String,
    /// Application or internal action name. Acks carry none.
    #[serde(default)]
    pub action: String,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Handle of the sending bus.
    pub from: Handle,
    /// Intended recipient. Absent on discovery broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Handle>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expects_response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_ack: bool,
    /// Code the recipient must echo back in an ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_code: Option<CorrelationCode>,
    /// Code pairing a request with its response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<CorrelationCode>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Envelope {
    /// Registration announcement. Sent without a recipient.
    pub fn register(from: &Handle, is_child: bool) -> Self {
        EnvelopeBuilder::new(from, InternalAction::Registration.as_str())
            .payload(json!({ "isChild": is_child }))
            .build()
    }

    /// Deregistration notice to a specific peer.
    pub fn deregister(from: &Handle, to: &Handle) -> Self {
        EnvelopeBuilder::new(from, InternalAction::Deregistration.as_str())
            .to(to)
            .payload(json!({ "destroyed": true }))
            .build()
    }

    /// Tell a peer which of our children it should register with.
    pub fn distribute(from: &Handle, ordinals: &[usize]) -> Self {
        EnvelopeBuilder::new(from, InternalAction::Distribution.as_str())
            .payload(json!({ "isDescendent": false, "windows": ordinals }))
            .build()
    }

    /// Application message. `ack_code` asks the recipient to acknowledge.
    pub fn message(
        from: &Handle,
        to: &Handle,
        action: &str,
        payload: Value,
        ack_code: Option<CorrelationCode>,
    ) -> Self {
        let mut builder = EnvelopeBuilder::new(from, action).to(to).payload(payload);
        if let Some(code) = ack_code {
            builder = builder.ack_code(code);
        }
        builder.build()
    }

    /// Request expecting a response under `code`.
    pub fn request(
        from: &Handle,
        to: &Handle,
        action: &str,
        payload: Value,
        code: CorrelationCode,
    ) -> Self {
        EnvelopeBuilder::new(from, action)
            .to(to)
            .payload(payload)
            .expects_response(code)
            .build()
    }

    /// Response to a request made under `request_action`.
    pub fn response(
        from: &Handle,
        to: &Handle,
        request_action: &str,
        payload: Value,
        code: CorrelationCode,
    ) -> Self {
        EnvelopeBuilder::new(from, &response_action(request_action))
            .to(to)
            .payload(payload)
            .response(code)
            .build()
    }

    /// Acknowledgement of a message sent under `code`.
    pub fn ack(from: &Handle, to: &Handle, code: CorrelationCode) -> Self {
        EnvelopeBuilder::new(from, "").to(to).ack(code).build()
    }

    /// Whether this envelope carries the protocol marker.
    pub fn is_bus_traffic(&self) -> bool {
        self.source == PROTOCOL_MARKER
    }

    /// The discovery action this envelope carries, if any.
    pub fn internal_action(&self) -> Option<InternalAction> {
        InternalAction::from_action(&self.action)
    }

    /// Encode for posting through the host.
    pub fn to_value(&self) -> Result<Value, BusError> {
        serde_json::to_value(self).map_err(|e| BusError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }

    /// Decode a value posted to this context.
    ///
    /// Returns `Ok(None)` for anything without the protocol marker: such
    /// traffic is not ours and must be ignored silently. Marked values
    /// that do not decode are an error.
    pub fn from_value(data: Value) -> Result<Option<Self>, BusError> {
        let marked = data
            .get("_source")
            .and_then(Value::as_str)
            .is_some_and(|s| s == PROTOCOL_MARKER);
        if !marked {
            return Ok(None);
        }
        serde_json::from_value(data)
            .map(Some)
            .map_err(|e| BusError::InvalidEnvelope {
                reason: e.to_string(),
            })
    }
}

// ── Builder ───────────────────────────────────────────────────────────

/// Fluent construction of envelopes.
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn new(from: &Handle, action: &str) -> Self {
        Self {
            envelope: Envelope {
                source: PROTOCOL_MARKER.to_string(),
                action: action.to_string(),
                payload: Value::Null,
                from: from.clone(),
                to: None,
                is_response: false,
                expects_response: false,
                is_ack: false,
                ack_code: None,
                response_code: None,
            },
        }
    }

    pub fn to(mut self, to: &Handle) -> Self {
        self.envelope.to = Some(to.clone());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.envelope.payload = payload;
        self
    }

    pub fn ack_code(mut self, code: CorrelationCode) -> Self {
        self.envelope.ack_code = Some(code);
        self
    }

    pub fn expects_response(mut self, code: CorrelationCode) -> Self {
        self.envelope.expects_response = true;
        self.envelope.response_code = Some(code);
        self
    }

    pub fn response(mut self, code: CorrelationCode) -> Self {
        self.envelope.is_response = true;
        self.envelope.response_code = Some(code);
        self
    }

    pub fn ack(mut self, code: CorrelationCode) -> Self {
        self.envelope.is_ack = true;
        self.envelope.ack_code = Some(code);
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}
