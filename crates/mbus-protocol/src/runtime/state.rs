use serde_json::{json, Value};
use tokio::time::Instant;

use crate::callbacks::CallbackRegistry;
use crate::correlation::{AckReceiver, CorrelationAllocator, PendingTable, ResponseMatch, ResponseReceiver};
use crate::debug::{BusLog, LogCategory};
use crate::discovery::{Discovery, DiscoveryAction, DiscoveryEvent};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::registry::PeerRegistry;
use crate::router::{Router, RoutingAction};
use crate::types::{
    ChannelId, CorrelationCode, Handle, InternalAction, DEREGISTERED_ACTION, REGISTERED_ACTION,
};
use crate::wait::{WaitOutcome, WaitRegistry};

use super::effect::{BusEffect, PostFailure, Responder};
use super::transport::HostTree;
use super::{BusCommand, BusConfig, CommandReply};

/// An operation that needs a peer's channel before it can go out.
pub(crate) enum Deferred {
    Message {
        action: String,
        payload: Value,
        reply: CommandReply<AckReceiver>,
    },
    Request {
        action: String,
        payload: Value,
        reply: CommandReply<(Handle, ResponseReceiver)>,
    },
    Ack {
        code: CorrelationCode,
    },
    Response {
        action: String,
        payload: Value,
        code: CorrelationCode,
    },
    Relay {
        ordinals: Vec<usize>,
    },
}

/// A deferred operation parked until `handle` registers.
pub(crate) struct Parked {
    handle: Handle,
    op: Deferred,
}

/// Complete bus state — pure logic, no async, no host access beyond
/// tree queries.
///
/// Every handle_* / tick_* method returns `Vec<BusEffect>`. No method
/// posts anything or runs a callback itself.
pub struct BusState {
    pub(crate) local: Handle,
    pub(crate) config: BusConfig,
    registry: PeerRegistry,
    router: Router,
    discovery: Discovery,
    callbacks: CallbackRegistry,
    pending: PendingTable,
    waits: WaitRegistry<Parked>,
    log: BusLog,
}

impl BusState {
    pub fn new(config: BusConfig) -> Self {
        let local = config.handle.clone();
        let allocator = match config.correlation_seed {
            Some(seed) => CorrelationAllocator::with_seed(seed),
            None => CorrelationAllocator::new(),
        };
        Self {
            registry: PeerRegistry::new(local.clone()),
            router: Router::new(local.clone()),
            discovery: Discovery::new(local.clone()),
            callbacks: CallbackRegistry::new(),
            pending: PendingTable::new(allocator),
            waits: WaitRegistry::new(),
            log: BusLog::new(local.as_str(), config.debug.clone()),
            local,
            config,
        }
    }

    pub fn has_waits(&self) -> bool {
        !self.waits.is_empty()
    }

    // ── Startup / teardown ───────────────────────────────────────────

    /// Registration wave sent when the bus starts.
    pub(crate) fn announce<H: HostTree>(&mut self, host: &H, now: Instant) -> Vec<BusEffect> {
        let actions = self.discovery.announce(host);
        self.log.trace(LogCategory::InternalSend, "REGISTRATION", || {
            json!({ "targets": actions.len() })
        });
        self.apply_discovery(host, actions, now)
    }

    /// Deregistrations posted when the bus goes away. Not acknowledged.
    ///
    /// Parked operations are cancelled; their callers see `Shutdown`.
    pub(crate) fn teardown<H: HostTree>(&mut self, host: &H) -> Vec<BusEffect> {
        tracing::debug!(
            handle = %self.local,
            pending_acks = self.pending.pending_acks(),
            pending_responses = self.pending.pending_responses(),
            parked = self.waits.len(),
            "tearing down"
        );
        for token in self.waits.tokens() {
            if let Some(Parked { handle, op }) = self.waits.cancel(token) {
                self.abandon(handle, op, BusError::Shutdown);
            }
        }

        let posts = self.discovery.farewell(&self.registry, host);
        posts
            .into_iter()
            .filter_map(|action| match action {
                DiscoveryAction::Post { target, envelope } => {
                    self.log.trace(LogCategory::InternalSend, "DEREGISTRATION", || {
                        json!({ "to": envelope.to, "channel": target.to_string() })
                    });
                    Some(BusEffect::Post { target, envelope })
                }
                _ => None,
            })
            .collect()
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// A value posted to our context by `source`.
    pub(crate) fn handle_inbound<H: HostTree>(
        &mut self,
        host: &H,
        source: ChannelId,
        data: Value,
        now: Instant,
    ) -> Vec<BusEffect> {
        let envelope = match Envelope::from_value(data) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(handle = %self.local, %source, error = %e, "dropping malformed envelope");
                return Vec::new();
            }
        };

        match self.router.route(&self.registry, source, envelope) {
            RoutingAction::Internal { action, envelope } => {
                self.handle_internal(host, source, action, &envelope, now)
            }
            RoutingAction::Ack { code, from } => {
                if let Some((handle, action)) = self.pending.resolve_ack(code) {
                    self.log.trace(LogCategory::Send, "ACKNOWLEDGED", || {
                        json!({ "to": handle, "action": action, "ackCode": code })
                    });
                } else {
                    tracing::debug!(handle = %self.local, %from, code, "ack for unknown code");
                }
                Vec::new()
            }
            RoutingAction::Response {
                code,
                from,
                action,
                payload,
            } => {
                let detail = json!({ "from": from, "action": action, "responseCode": code });
                match self.pending.resolve_response(code, &from, &action, payload) {
                    ResponseMatch::Resolved => {
                        self.log.trace(LogCategory::Request, "RESPONSE RECEIVED", || detail);
                    }
                    ResponseMatch::Unknown | ResponseMatch::Mismatch => {
                        tracing::warn!(handle = %self.local, %detail, "response matches no pending request");
                    }
                }
                Vec::new()
            }
            RoutingAction::Request {
                from,
                action,
                payload,
                code,
            } => self.handle_request(from, action, payload, code),
            RoutingAction::Deliver {
                from,
                action,
                payload,
                ack_code,
            } => self.handle_message(host, from, action, payload, ack_code, now),
            RoutingAction::Reject { reason } => {
                tracing::error!(handle = %self.local, %source, %reason, "rejected envelope");
                Vec::new()
            }
            RoutingAction::Drop => Vec::new(),
        }
    }

    fn handle_internal<H: HostTree>(
        &mut self,
        host: &H,
        source: ChannelId,
        action: InternalAction,
        envelope: &Envelope,
        now: Instant,
    ) -> Vec<BusEffect> {
        let title = match action {
            InternalAction::Registration => "RECEIVE REGISTRATION",
            InternalAction::Deregistration => "RECEIVE DEREGISTRATION",
            InternalAction::Distribution => "RECEIVE DISTRIBUTE REQUEST",
        };
        self.log.trace(LogCategory::Internal, title, || {
            json!({ "from": envelope.from, "channel": source.to_string(), "payload": envelope.payload })
        });
        let actions = self
            .discovery
            .handle(&mut self.registry, host, source, envelope);
        self.apply_discovery(host, actions, now)
    }

    fn handle_message<H: HostTree>(
        &mut self,
        host: &H,
        from: Handle,
        action: String,
        payload: Value,
        ack_code: Option<CorrelationCode>,
        now: Instant,
    ) -> Vec<BusEffect> {
        let callbacks = self.callbacks.for_action(&action);
        self.log.trace(LogCategory::Send, "RECEIVED", || {
            json!({ "from": from, "action": action, "ackCode": ack_code, "callbacks": callbacks.len() })
        });

        let mut effects = Vec::new();
        if let Some(code) = ack_code {
            effects.extend(self.resolve_or_wait(host, from.clone(), Deferred::Ack { code }, now));
        }
        if !callbacks.is_empty() {
            effects.push(BusEffect::Invoke {
                callbacks,
                action,
                payload,
                from,
            });
        }
        effects
    }

    fn handle_request(
        &mut self,
        from: Handle,
        action: String,
        payload: Value,
        code: CorrelationCode,
    ) -> Vec<BusEffect> {
        let mut callbacks = self.callbacks.for_action(&action);
        self.log.trace(LogCategory::Request, "REQUEST RECEIVED", || {
            json!({ "from": from, "action": action, "responseCode": code })
        });

        match callbacks.len() {
            0 => {
                self.log.trace(LogCategory::Request, "NO CALLBACK", || {
                    json!({ "from": from, "action": action })
                });
                Vec::new()
            }
            1 => match callbacks.pop() {
                Some(callback) => vec![BusEffect::Respond {
                    callback,
                    action,
                    payload,
                    from,
                    code,
                }],
                None => Vec::new(),
            },
            count => {
                tracing::error!(
                    handle = %self.local,
                    %action,
                    count,
                    "several callbacks bound to a request action, not answering"
                );
                Vec::new()
            }
        }
    }

    /// A callback produced an answer to a request from `responder.to`.
    pub(crate) fn handle_responder<H: HostTree>(
        &mut self,
        host: &H,
        responder: Responder,
        now: Instant,
    ) -> Vec<BusEffect> {
        let Responder {
            to,
            action,
            payload,
            code,
        } = responder;
        self.resolve_or_wait(host, to, Deferred::Response { action, payload, code }, now)
    }

    /// The host refused a post. Fail whoever waits on it.
    pub(crate) fn handle_post_failure(&mut self, failure: PostFailure) {
        let PostFailure {
            target,
            envelope,
            error,
        } = failure;
        tracing::warn!(
            handle = %self.local,
            %target,
            action = %envelope.action,
            error = %error,
            "post failed"
        );
        let code = if envelope.is_ack || envelope.is_response {
            None
        } else if envelope.expects_response {
            envelope.response_code
        } else {
            envelope.ack_code
        };
        if let Some(code) = code {
            self.pending.fail(code, BusError::Transport(error));
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub(crate) fn handle_command<H: HostTree>(
        &mut self,
        host: &H,
        cmd: BusCommand,
        now: Instant,
    ) -> Vec<BusEffect> {
        match cmd {
            BusCommand::AddCallback {
                action,
                callback,
                reply,
            } => {
                self.callbacks.add(&action, callback);
                let _ = reply.send(());
                Vec::new()
            }
            BusCommand::RemoveCallback {
                action,
                callback,
                reply,
            } => {
                let _ = reply.send(self.callbacks.remove(&action, &callback));
                Vec::new()
            }
            BusCommand::SendMessage {
                handle,
                action,
                payload,
                reply,
            } => self.resolve_or_wait(
                host,
                handle,
                Deferred::Message {
                    action,
                    payload,
                    reply,
                },
                now,
            ),
            BusCommand::SendMessageToChannel {
                channel,
                handle,
                action,
                payload,
                reply,
            } => match self.handle_for(host, channel, handle) {
                Ok(handle) => self.proceed(
                    host,
                    channel,
                    handle,
                    Deferred::Message {
                        action,
                        payload,
                        reply,
                    },
                    now,
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            BusCommand::SendRequest {
                handle,
                action,
                payload,
                reply,
            } => self.resolve_or_wait(
                host,
                handle,
                Deferred::Request {
                    action,
                    payload,
                    reply,
                },
                now,
            ),
            BusCommand::SendRequestToChannel {
                channel,
                handle,
                action,
                payload,
                reply,
            } => match self.handle_for(host, channel, handle) {
                Ok(handle) => self.proceed(
                    host,
                    channel,
                    handle,
                    Deferred::Request {
                        action,
                        payload,
                        reply,
                    },
                    now,
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            BusCommand::ActiveHandles {
                direct_descendants_only,
                reply,
            } => {
                let handles = self
                    .registry
                    .active(host)
                    .into_iter()
                    .map(|(handle, _)| handle)
                    .filter(|handle| {
                        !direct_descendants_only || self.registry.is_descendant(handle.as_str())
                    })
                    .collect();
                let _ = reply.send(handles);
                Vec::new()
            }
            BusCommand::DirectDescendants { reply } => {
                let _ = reply.send(self.registry.descendants().to_vec());
                Vec::new()
            }
            BusCommand::ParentHandle { reply } => {
                let parent = host
                    .parent()
                    .and_then(|channel| self.registry.handle_on(channel, host))
                    .ok_or(BusError::ParentNotRegistered);
                let _ = reply.send(parent);
                Vec::new()
            }
            // The loop tears down before this could get here.
            BusCommand::Destroy => Vec::new(),
        }
    }

    fn handle_for<H: HostTree>(
        &self,
        host: &H,
        channel: ChannelId,
        handle: Option<Handle>,
    ) -> Result<Handle, BusError> {
        handle
            .or_else(|| self.registry.handle_on(channel, host))
            .ok_or(BusError::UnknownChannel { channel })
    }

    // ── Waits ────────────────────────────────────────────────────────

    /// Re-check parked operations.
    pub(crate) fn tick_waits<H: HostTree>(&mut self, host: &H, now: Instant) -> Vec<BusEffect> {
        let registry = &self.registry;
        let outcomes = self.waits.poll(now, |parked| {
            registry.active_channel(parked.handle.as_str(), host).is_some()
        });

        let mut effects = Vec::new();
        for outcome in outcomes {
            match outcome {
                WaitOutcome::Ready(Parked { handle, op }) => {
                    match self.registry.active_channel(handle.as_str(), host) {
                        Some(channel) => effects.extend(self.proceed(host, channel, handle, op, now)),
                        None => {
                            let error = BusError::UnknownHandle { handle: handle.clone() };
                            self.abandon(handle, op, error);
                        }
                    }
                }
                WaitOutcome::TimedOut(Parked { handle, op }) => {
                    let error = BusError::UnknownHandle { handle: handle.clone() };
                    self.abandon(handle, op, error);
                }
            }
        }
        effects
    }

    /// Run `op` against `handle` now if it is known, or park it.
    fn resolve_or_wait<H: HostTree>(
        &mut self,
        host: &H,
        handle: Handle,
        op: Deferred,
        now: Instant,
    ) -> Vec<BusEffect> {
        match self.registry.active_channel(handle.as_str(), host) {
            Some(channel) => self.proceed(host, channel, handle, op, now),
            None => {
                self.waits
                    .register(Parked { handle, op }, self.config.resolve_timeout, now);
                Vec::new()
            }
        }
    }

    fn proceed<H: HostTree>(
        &mut self,
        host: &H,
        channel: ChannelId,
        handle: Handle,
        op: Deferred,
        now: Instant,
    ) -> Vec<BusEffect> {
        match op {
            Deferred::Message {
                action,
                payload,
                reply,
            } => match self.pending.expect_ack(&handle, &action) {
                Ok((code, ack)) => {
                    self.log.trace(LogCategory::Send, "SEND", || {
                        json!({ "to": handle, "action": action, "ackCode": code, "payload": payload })
                    });
                    let envelope = Envelope::message(&self.local, &handle, &action, payload, Some(code));
                    let _ = reply.send(Ok(ack));
                    vec![BusEffect::Post {
                        target: channel,
                        envelope,
                    }]
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            Deferred::Request {
                action,
                payload,
                reply,
            } => match self.pending.expect_response(&handle, &action) {
                Ok((code, response)) => {
                    self.log.trace(LogCategory::Request, "REQUEST", || {
                        json!({ "to": handle, "action": action, "responseCode": code, "payload": payload })
                    });
                    let envelope = Envelope::request(&self.local, &handle, &action, payload, code);
                    let _ = reply.send(Ok((handle, response)));
                    vec![BusEffect::Post {
                        target: channel,
                        envelope,
                    }]
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            Deferred::Ack { code } => vec![BusEffect::Post {
                target: channel,
                envelope: Envelope::ack(&self.local, &handle, code),
            }],
            Deferred::Response {
                action,
                payload,
                code,
            } => {
                self.log.trace(LogCategory::Request, "RESPONSE", || {
                    json!({ "to": handle, "action": action, "responseCode": code, "payload": payload })
                });
                vec![BusEffect::Post {
                    target: channel,
                    envelope: Envelope::response(&self.local, &handle, &action, payload, code),
                }]
            }
            Deferred::Relay { ordinals } => {
                let actions = self.discovery.relay(host, channel, &ordinals);
                self.apply_discovery(host, actions, now)
            }
        }
    }

    /// Give up on a parked operation: `handle` never showed up, or the bus
    /// is stopping.
    fn abandon(&mut self, handle: Handle, op: Deferred, error: BusError) {
        match op {
            Deferred::Message { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Deferred::Request { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Deferred::Ack { code } => {
                tracing::warn!(handle = %self.local, peer = %handle, code, %error, "could not acknowledge");
            }
            Deferred::Response { action, code, .. } => {
                tracing::warn!(handle = %self.local, peer = %handle, %action, code, %error, "could not respond");
            }
            Deferred::Relay { .. } => {
                tracing::warn!(handle = %self.local, peer = %handle, %error, "could not relay registrations");
            }
        }
    }

    // ── Discovery glue ───────────────────────────────────────────────

    fn apply_discovery<H: HostTree>(
        &mut self,
        host: &H,
        actions: Vec<DiscoveryAction>,
        now: Instant,
    ) -> Vec<BusEffect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                DiscoveryAction::Post { target, envelope } => {
                    self.log.trace(LogCategory::InternalSend, envelope.action.as_str(), || {
                        json!({ "channel": target.to_string(), "payload": envelope.payload })
                    });
                    effects.push(BusEffect::Post { target, envelope });
                }
                DiscoveryAction::Relay { via, ordinals } => {
                    effects.extend(self.resolve_or_wait(host, via, Deferred::Relay { ordinals }, now));
                }
                DiscoveryAction::Event(DiscoveryEvent::Registered(handle)) => {
                    effects.extend(self.notify(REGISTERED_ACTION, handle));
                }
                DiscoveryAction::Event(DiscoveryEvent::Deregistered(handle)) => {
                    effects.extend(self.notify(DEREGISTERED_ACTION, handle));
                }
            }
        }
        effects
    }

    fn notify(&self, action: &str, from: Handle) -> Option<BusEffect> {
        let callbacks = self.callbacks.for_action(action);
        if callbacks.is_empty() {
            return None;
        }
        Some(BusEffect::Invoke {
            callbacks,
            action: action.to_string(),
            payload: json!({}),
            from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::callbacks::{Callback, Reply};
    use crate::runtime::transport::mock::{ch, MockHost};
    use crate::runtime::executor::execute_effects;

    fn h(name: &str) -> Handle {
        Handle::from(name)
    }

    fn state(name: &str) -> BusState {
        BusState::new(BusConfig {
            correlation_seed: Some(1),
            ..BusConfig::new(name)
        })
    }

    fn posts(effects: &[BusEffect]) -> Vec<(ChannelId, Envelope)> {
        effects
            .iter()
            .filter_map(|e| match e {
                BusEffect::Post { target, envelope } => Some((*target, envelope.clone())),
                _ => None,
            })
            .collect()
    }

    fn inbound(
        st: &mut BusState,
        host: &MockHost,
        source: ChannelId,
        envelope: Envelope,
        now: Instant,
    ) -> Vec<BusEffect> {
        st.handle_inbound(host, source, envelope.to_value().unwrap(), now)
    }

    /// A at ch(1), B registered on ch(2).
    fn with_peer_b() -> (BusState, MockHost, Instant) {
        let host = MockHost::new(ch(1));
        host.set_children(ch(1), vec![ch(2)]);
        host.set_own_root(Some(ch(1)));
        let mut st = state("A");
        let now = Instant::now();
        inbound(&mut st, &host, ch(2), Envelope::register(&h("B"), true), now);
        (st, host, now)
    }

    fn add_callback(st: &mut BusState, host: &MockHost, action: &str, cb: Callback) {
        let (tx, _rx) = oneshot::channel();
        st.handle_command(
            host,
            BusCommand::AddCallback {
                action: action.into(),
                callback: cb,
                reply: tx,
            },
            Instant::now(),
        );
    }

    #[test]
    fn announce_targets_tree_and_self() {
        let host = MockHost::new(ch(2));
        host.set_children(ch(1), vec![ch(2)]);
        host.set_own_root(Some(ch(1)));
        host.set_parent(Some(ch(1)));
        let mut st = state("B");

        let sent = posts(&st.announce(&host, Instant::now()));
        let targets: Vec<_> = sent.iter().map(|(t, _)| *t).collect();
        assert_eq!(targets, vec![ch(2), ch(1)]);
        assert_eq!(sent[1].1.payload, json!({"isChild": true}));
    }

    #[test]
    fn registration_fires_registered_callbacks() {
        let host = MockHost::new(ch(1));
        let mut st = state("A");
        add_callback(&mut st, &host, "registered", Callback::new(|_, _, _| Reply::None));

        let effects = inbound(&mut st, &host, ch(2), Envelope::register(&h("B"), false), Instant::now());

        let sent = posts(&effects);
        assert_eq!(sent[0].0, ch(2));
        assert_eq!(sent[0].1.internal_action(), Some(InternalAction::Registration));
        assert!(effects.iter().any(|e| matches!(
            e,
            BusEffect::Invoke { action, from, payload, .. }
                if action == "registered" && *from == h("B") && *payload == json!({})
        )));
    }

    #[test]
    fn foreign_values_have_no_effect() {
        let (mut st, host, now) = with_peer_b();
        let effects = st.handle_inbound(&host, ch(2), json!({"from": "B", "to": "A", "action": "x"}), now);
        assert!(effects.is_empty());
        let effects = st.handle_inbound(&host, ch(2), json!("hello"), now);
        assert!(effects.is_empty());
    }

    #[test]
    fn message_is_acked_then_dispatched() {
        let (mut st, host, now) = with_peer_b();
        add_callback(&mut st, &host, "hello", Callback::new(|_, _, _| Reply::None));

        let env = Envelope::message(&h("B"), &h("A"), "hello", json!("hi"), Some(77));
        let effects = inbound(&mut st, &host, ch(2), env, now);

        let sent = posts(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ch(2));
        assert!(sent[0].1.is_ack);
        assert_eq!(sent[0].1.ack_code, Some(77));
        assert!(matches!(effects.last(), Some(BusEffect::Invoke { callbacks, .. }) if callbacks.len() == 1));
    }

    #[test]
    fn spoofed_message_is_ignored() {
        let (mut st, host, now) = with_peer_b();
        add_callback(&mut st, &host, "hello", Callback::new(|_, _, _| Reply::None));

        let env = Envelope::message(&h("B"), &h("A"), "hello", json!("hi"), Some(77));
        assert!(inbound(&mut st, &host, ch(9), env, now).is_empty());
    }

    #[test]
    fn request_needs_exactly_one_callback() {
        let (mut st, host, now) = with_peer_b();
        let env = Envelope::request(&h("B"), &h("A"), "ping", json!({}), 5);
        assert!(inbound(&mut st, &host, ch(2), env.clone(), now).is_empty());

        add_callback(&mut st, &host, "ping", Callback::new(|_, _, _| json!({"pong": true}).into()));
        let effects = inbound(&mut st, &host, ch(2), env.clone(), now);
        assert!(matches!(
            effects.as_slice(),
            [BusEffect::Respond { code: 5, action, .. }] if action == "ping"
        ));

        add_callback(&mut st, &host, "ping", Callback::new(|_, _, _| json!(1).into()));
        assert!(inbound(&mut st, &host, ch(2), env, now).is_empty());
    }

    #[test]
    fn responder_posts_response() {
        let (mut st, host, now) = with_peer_b();
        let responder = Responder {
            to: h("B"),
            action: "ping".into(),
            payload: json!({"pong": true}),
            code: 5,
        };
        let sent = posts(&st.handle_responder(&host, responder, now));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.action, "RESPONSE_ping");
        assert_eq!(sent[0].1.response_code, Some(5));
        assert!(sent[0].1.is_response);
    }

    #[test]
    fn send_message_then_ack_resolves() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendMessage {
                handle: h("B"),
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        );
        let sent = posts(&effects);
        let code = sent[0].1.ack_code.unwrap();
        let mut ack = rx.try_recv().unwrap().unwrap();

        // An ack for some other code settles nothing.
        let other = if code == 1 { 2 } else { 1 };
        inbound(&mut st, &host, ch(2), Envelope::ack(&h("B"), &h("A"), other), now);
        assert!(ack.try_recv().is_err());

        inbound(&mut st, &host, ch(2), Envelope::ack(&h("B"), &h("A"), code), now);
        assert!(ack.try_recv().unwrap().is_ok());
    }

    #[test]
    fn response_from_wrong_peer_is_ignored() {
        let (mut st, host, now) = with_peer_b();
        inbound(&mut st, &host, ch(3), Envelope::register(&h("C"), false), now);

        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendRequest {
                handle: h("B"),
                action: "ping".into(),
                payload: json!({}),
                reply: tx,
            },
            now,
        );
        let code = posts(&effects)[0].1.response_code.unwrap();
        let (handle, mut response) = rx.try_recv().unwrap().unwrap();
        assert_eq!(handle, h("B"));

        let forged = Envelope::response(&h("C"), &h("A"), "ping", json!(1), code);
        inbound(&mut st, &host, ch(3), forged, now);
        assert!(response.try_recv().is_err());

        let real = Envelope::response(&h("B"), &h("A"), "ping", json!({"pong": true}), code);
        inbound(&mut st, &host, ch(2), real, now);
        assert_eq!(response.try_recv().unwrap().unwrap(), json!({"pong": true}));
    }

    #[test]
    fn unknown_handle_times_out() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendMessage {
                handle: h("ghost"),
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        );
        assert!(effects.is_empty());
        assert!(st.has_waits());

        assert!(st.tick_waits(&host, now + Duration::from_millis(400)).is_empty());
        assert!(rx.try_recv().is_err());

        st.tick_waits(&host, now + Duration::from_millis(501));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(BusError::UnknownHandle { handle }) if handle == h("ghost")
        ));
        assert!(!st.has_waits());
    }

    #[test]
    fn parked_send_goes_out_once_peer_registers() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        st.handle_command(
            &host,
            BusCommand::SendRequest {
                handle: h("C"),
                action: "ping".into(),
                payload: json!({}),
                reply: tx,
            },
            now,
        );

        inbound(&mut st, &host, ch(3), Envelope::register(&h("C"), false), now);
        let sent = posts(&st.tick_waits(&host, now + Duration::from_millis(4)));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ch(3));
        assert!(sent[0].1.expects_response);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn distribution_relays_to_children_of_sender() {
        let (mut st, host, now) = with_peer_b();
        host.set_children(ch(2), vec![ch(5), ch(6)]);

        let sent = posts(&inbound(&mut st, &host, ch(2), Envelope::distribute(&h("B"), &[1]), now));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ch(6));
        assert_eq!(sent[0].1.payload, json!({"isChild": false}));
    }

    #[test]
    fn deregistration_forgets_peer() {
        let (mut st, host, now) = with_peer_b();
        add_callback(&mut st, &host, "deregistered", Callback::new(|_, _, _| Reply::None));

        let effects = inbound(&mut st, &host, ch(2), Envelope::deregister(&h("B"), &h("A")), now);
        assert!(matches!(
            effects.as_slice(),
            [BusEffect::Invoke { action, .. }] if action == "deregistered"
        ));

        let (tx, mut rx) = oneshot::channel();
        st.handle_command(
            &host,
            BusCommand::ActiveHandles {
                direct_descendants_only: false,
                reply: tx,
            },
            now,
        );
        assert!(rx.try_recv().unwrap().is_empty());
    }

    #[test]
    fn channel_send_without_handle_uses_registry() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        let sent = posts(&st.handle_command(
            &host,
            BusCommand::SendMessageToChannel {
                channel: ch(2),
                handle: None,
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        ));
        assert_eq!(sent[0].1.to, Some(h("B")));
        assert!(rx.try_recv().unwrap().is_ok());

        let (tx, mut rx) = oneshot::channel();
        st.handle_command(
            &host,
            BusCommand::SendMessageToChannel {
                channel: ch(9),
                handle: None,
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        );
        assert!(matches!(rx.try_recv().unwrap(), Err(BusError::UnknownChannel { .. })));
    }

    #[test]
    fn parent_handle_lookup() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        st.handle_command(&host, BusCommand::ParentHandle { reply: tx }, now);
        assert!(matches!(rx.try_recv().unwrap(), Err(BusError::ParentNotRegistered)));

        host.set_parent(Some(ch(2)));
        let (tx, mut rx) = oneshot::channel();
        st.handle_command(&host, BusCommand::ParentHandle { reply: tx }, now);
        assert_eq!(rx.try_recv().unwrap().unwrap(), h("B"));
    }

    #[test]
    fn descendants_filter() {
        let (mut st, host, now) = with_peer_b();
        inbound(&mut st, &host, ch(3), Envelope::register(&h("C"), false), now);

        let (tx, mut rx) = oneshot::channel();
        st.handle_command(
            &host,
            BusCommand::ActiveHandles {
                direct_descendants_only: true,
                reply: tx,
            },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), vec![h("B")]);
    }

    #[test]
    fn failed_post_fails_the_sender() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendMessage {
                handle: h("B"),
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        );
        let (target, envelope) = posts(&effects).remove(0);
        let mut ack = rx.try_recv().unwrap().unwrap();

        st.handle_post_failure(PostFailure {
            target,
            envelope,
            error: mbus_transport::TransportError::ChannelClosed(target),
        });
        assert!(matches!(ack.try_recv().unwrap(), Err(BusError::Transport(_))));
    }

    #[test]
    fn teardown_deregisters_from_live_peers() {
        let (mut st, host, now) = with_peer_b();
        inbound(&mut st, &host, ch(3), Envelope::register(&h("C"), false), now);
        host.kill(ch(3));

        let sent = posts(&st.teardown(&host));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ch(2));
        assert_eq!(sent[0].1.internal_action(), Some(InternalAction::Deregistration));
        assert!(sent[0].1.ack_code.is_none());
    }

    #[test]
    fn refused_request_fails_the_caller() {
        let (mut st, host, now) = with_peer_b();
        host.set_fail_posts(true);

        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendRequest {
                handle: h("B"),
                action: "ping".into(),
                payload: json!({}),
                reply: tx,
            },
            now,
        );
        let code = posts(&effects)[0].1.response_code.unwrap();
        let (_, mut response) = rx.try_recv().unwrap().unwrap();
        assert!(st.pending.is_pending(code));

        let (respond_tx, _respond_rx) = tokio::sync::mpsc::unbounded_channel();
        for failure in execute_effects(effects, &host, &respond_tx) {
            st.handle_post_failure(failure);
        }

        assert!(host.sent_envelopes().is_empty());
        assert!(matches!(response.try_recv().unwrap(), Err(BusError::Transport(_))));
        assert!(!st.pending.is_pending(code));
    }

    #[test]
    fn accepted_post_keeps_ack_pending() {
        let (mut st, host, now) = with_peer_b();
        host.clear_sent();

        let (tx, mut rx) = oneshot::channel();
        let effects = st.handle_command(
            &host,
            BusCommand::SendMessage {
                handle: h("B"),
                action: "hello".into(),
                payload: json!(1),
                reply: tx,
            },
            now,
        );
        let mut ack = rx.try_recv().unwrap().unwrap();

        let (respond_tx, _respond_rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(execute_effects(effects, &host, &respond_tx).is_empty());

        let sent = host.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ch(2));
        assert_eq!(sent[0].1.action, "hello");
        let code = sent[0].1.ack_code.unwrap();
        assert!(st.pending.is_pending(code));
        assert!(ack.try_recv().is_err());
    }

    #[test]
    fn teardown_fails_parked_sends() {
        let (mut st, host, now) = with_peer_b();
        let (tx, mut rx) = oneshot::channel();
        st.handle_command(
            &host,
            BusCommand::SendRequest {
                handle: h("ghost"),
                action: "ping".into(),
                payload: json!({}),
                reply: tx,
            },
            now,
        );
        assert!(st.has_waits());

        st.teardown(&host);
        assert!(!st.has_waits());
        assert!(matches!(rx.try_recv().unwrap(), Err(BusError::Shutdown)));
    }
}
