/// Correlation codes and the tables of operations waiting on them.
///
/// Every outstanding ack or response has a code drawn at random from
/// `1..CODE_SPACE`. A code is never handed out twice while either table
/// still holds it.
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BusError;
use crate::types::{response_action, CorrelationCode, Handle, CODE_SPACE};

/// Resolves when the peer acknowledges, or with the reason it never will.
pub type AckReceiver = oneshot::Receiver<Result<(), BusError>>;

/// Resolves with the response payload, or with the reason it never will.
pub type ResponseReceiver = oneshot::Receiver<Result<Value, BusError>>;

/// Draws correlation codes.
pub struct CorrelationAllocator {
    rng: StdRng,
}

impl CorrelationAllocator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic allocator for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw until `in_use` rejects nothing. `outstanding` is the number of
    /// codes currently held, used to bail out instead of spinning forever.
    pub fn allocate(
        &mut self,
        outstanding: usize,
        in_use: impl Fn(CorrelationCode) -> bool,
    ) -> Result<CorrelationCode, BusError> {
        if outstanding >= (CODE_SPACE - 1) as usize {
            return Err(BusError::CodesExhausted);
        }
        loop {
            let code = self.rng.random_range(1..CODE_SPACE);
            if !in_use(code) {
                return Ok(code);
            }
        }
    }
}

impl Default for CorrelationAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Pending tables ────────────────────────────────────────────────────

/// An ack we are waiting for.
struct PendingAck {
    handle: Handle,
    action: String,
    reply: oneshot::Sender<Result<(), BusError>>,
}

/// A response we are waiting for.
struct PendingResponse {
    handle: Handle,
    action: String,
    reply: oneshot::Sender<Result<Value, BusError>>,
}

/// Outcome of matching an incoming response against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatch {
    /// Delivered to the waiting caller (who may have given up already).
    Resolved,
    /// No request is waiting under that code.
    Unknown,
    /// A request is waiting, but for another peer or action. Left in place.
    Mismatch,
}

/// Outstanding acks and responses, keyed by correlation code.
pub struct PendingTable {
    allocator: CorrelationAllocator,
    acks: HashMap<CorrelationCode, PendingAck>,
    responses: HashMap<CorrelationCode, PendingResponse>,
}

impl PendingTable {
    pub fn new(allocator: CorrelationAllocator) -> Self {
        Self {
            allocator,
            acks: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    fn next_code(&mut self) -> Result<CorrelationCode, BusError> {
        let outstanding = self.acks.len() + self.responses.len();
        let acks = &self.acks;
        let responses = &self.responses;
        self.allocator.allocate(outstanding, |code| {
            acks.contains_key(&code) || responses.contains_key(&code)
        })
    }

    /// Reserve a code for a message awaiting acknowledgement from `handle`.
    pub fn expect_ack(
        &mut self,
        handle: &Handle,
        action: &str,
    ) -> Result<(CorrelationCode, AckReceiver), BusError> {
        let code = self.next_code()?;
        let (tx, rx) = oneshot::channel();
        self.acks.insert(
            code,
            PendingAck {
                handle: handle.clone(),
                action: action.to_string(),
                reply: tx,
            },
        );
        Ok((code, rx))
    }

    /// Reserve a code for a request to `handle` under `action`.
    pub fn expect_response(
        &mut self,
        handle: &Handle,
        action: &str,
    ) -> Result<(CorrelationCode, ResponseReceiver), BusError> {
        let code = self.next_code()?;
        let (tx, rx) = oneshot::channel();
        self.responses.insert(
            code,
            PendingResponse {
                handle: handle.clone(),
                action: action.to_string(),
                reply: tx,
            },
        );
        Ok((code, rx))
    }

    /// Settle the ack registered under `code`. Returns the peer and action
    /// it was for.
    pub fn resolve_ack(&mut self, code: CorrelationCode) -> Option<(Handle, String)> {
        let pending = self.acks.remove(&code)?;
        let _ = pending.reply.send(Ok(()));
        Some((pending.handle, pending.action))
    }

    /// Fail whatever waits under `code`. Returns whether anything did.
    pub fn fail(&mut self, code: CorrelationCode, error: BusError) -> bool {
        if let Some(pending) = self.acks.remove(&code) {
            let _ = pending.reply.send(Err(error));
            return true;
        }
        if let Some(pending) = self.responses.remove(&code) {
            let _ = pending.reply.send(Err(error));
            return true;
        }
        false
    }

    /// Match a response from `from` under `action` with code `code`.
    pub fn resolve_response(
        &mut self,
        code: CorrelationCode,
        from: &Handle,
        action: &str,
        payload: Value,
    ) -> ResponseMatch {
        let Some(pending) = self.responses.get(&code) else {
            return ResponseMatch::Unknown;
        };
        if pending.handle != *from || response_action(&pending.action) != action {
            return ResponseMatch::Mismatch;
        }
        if let Some(pending) = self.responses.remove(&code) {
            // The caller may have timed out and dropped its receiver.
            let _ = pending.reply.send(Ok(payload));
        }
        ResponseMatch::Resolved
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, code: CorrelationCode) -> bool {
        self.acks.contains_key(&code) || self.responses.contains_key(&code)
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(CorrelationAllocator::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> PendingTable {
        PendingTable::new(CorrelationAllocator::with_seed(7))
    }

    #[test]
    fn codes_stay_in_range() {
        let mut alloc = CorrelationAllocator::with_seed(1);
        for _ in 0..1_000 {
            let code = alloc.allocate(0, |_| false).unwrap();
            assert!((1..CODE_SPACE).contains(&code));
        }
    }

    #[test]
    fn allocator_skips_codes_in_use() {
        let mut alloc = CorrelationAllocator::with_seed(3);
        let first = alloc.allocate(0, |_| false).unwrap();

        let mut replay = CorrelationAllocator::with_seed(3);
        let second = replay.allocate(1, |c| c == first).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn exhausted_space_is_an_error() {
        let mut alloc = CorrelationAllocator::with_seed(1);
        let err = alloc
            .allocate((CODE_SPACE - 1) as usize, |_| true)
            .unwrap_err();
        assert!(matches!(err, BusError::CodesExhausted));
    }

    #[test]
    fn ack_resolves_once() {
        let mut t = table();
        let (code, mut rx) = t.expect_ack(&Handle::from("B"), "hello").unwrap();
        assert!(t.is_pending(code));

        let (handle, action) = t.resolve_ack(code).unwrap();
        assert_eq!(handle, Handle::from("B"));
        assert_eq!(action, "hello");
        assert!(rx.try_recv().unwrap().is_ok());

        assert!(t.resolve_ack(code).is_none());
        assert!(!t.is_pending(code));
    }

    #[test]
    fn response_must_match_peer_and_action() {
        let mut t = table();
        let (code, mut rx) = t.expect_response(&Handle::from("B"), "ping").unwrap();

        let wrong_peer = t.resolve_response(code, &Handle::from("C"), "RESPONSE_ping", json!(1));
        assert_eq!(wrong_peer, ResponseMatch::Mismatch);
        let wrong_action = t.resolve_response(code, &Handle::from("B"), "RESPONSE_pong", json!(1));
        assert_eq!(wrong_action, ResponseMatch::Mismatch);
        assert!(rx.try_recv().is_err());

        let ok = t.resolve_response(code, &Handle::from("B"), "RESPONSE_ping", json!({"pong": true}));
        assert_eq!(ok, ResponseMatch::Resolved);
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"pong": true}));
        assert_eq!(t.pending_responses(), 0);
    }

    #[test]
    fn late_response_after_caller_gave_up() {
        let mut t = table();
        let (code, rx) = t.expect_response(&Handle::from("B"), "ping").unwrap();
        drop(rx);

        let outcome = t.resolve_response(code, &Handle::from("B"), "RESPONSE_ping", json!(true));
        assert_eq!(outcome, ResponseMatch::Resolved);
        assert_eq!(t.pending_responses(), 0);
    }

    #[test]
    fn failure_reaches_caller() {
        let mut t = table();
        let (code, mut rx) = t.expect_ack(&Handle::from("B"), "hello").unwrap();
        assert!(t.fail(code, BusError::Shutdown));
        assert!(matches!(rx.try_recv().unwrap(), Err(BusError::Shutdown)));
        assert!(!t.fail(code, BusError::Shutdown));
        assert_eq!(t.pending_acks(), 0);
    }

    #[test]
    fn unknown_code() {
        let mut t = table();
        let outcome = t.resolve_response(5, &Handle::from("B"), "RESPONSE_ping", json!(true));
        assert_eq!(outcome, ResponseMatch::Unknown);
    }

    #[test]
    fn codes_unique_across_tables() {
        let mut t = table();
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            let code = if i % 2 == 0 {
                t.expect_ack(&Handle::from("B"), "m").unwrap().0
            } else {
                t.expect_response(&Handle::from("B"), "r").unwrap().0
            };
            assert!(seen.insert(code), "code {code} handed out twice");
        }
    }
}
