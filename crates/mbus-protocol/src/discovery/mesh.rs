/// The discovery engine: pure decisions, no I/O.
///
/// Feed it internal envelopes and the host tree; it updates the peer
/// registry and returns [`DiscoveryAction`]s for the runtime to carry out.
use serde::de::DeserializeOwned;

use crate::envelope::Envelope;
use crate::registry::PeerRegistry;
use crate::runtime::transport::HostTree;
use crate::types::{ChannelId, Handle, InternalAction};

use super::types::{
    DiscoveryAction, DiscoveryEvent, DistributePayload, RegisterPayload,
};

/// Every context nested below `root`, depth first, parents before their
/// children. `root` itself is not included.
pub fn walk_descendants<H: HostTree>(host: &H, root: ChannelId) -> Vec<ChannelId> {
    let mut out = Vec::new();
    let mut stack: Vec<ChannelId> = host.children(root).into_iter().rev().collect();
    while let Some(channel) = stack.pop() {
        out.push(channel);
        stack.extend(host.children(channel).into_iter().rev());
    }
    out
}

pub struct Discovery {
    local: Handle,
}

impl Discovery {
    pub fn new(local: Handle) -> Self {
        Self { local }
    }

    /// The wave a bus sends when it starts: a registration to every
    /// context of the opener's tree (for popups) and of its own tree.
    ///
    /// The local context is part of its own tree, so the bus registers
    /// with itself too.
    pub fn announce<H: HostTree>(&self, host: &H) -> Vec<DiscoveryAction> {
        let mut actions = Vec::new();
        if let Some(opener_root) = host.opener_root() {
            self.wave(host, opener_root, &mut actions);
        }
        let top = host.own_root().unwrap_or_else(|| host.local());
        self.wave(host, top, &mut actions);
        actions
    }

    fn wave<H: HostTree>(&self, host: &H, top: ChannelId, actions: &mut Vec<DiscoveryAction>) {
        let parent = host.parent();
        for target in walk_descendants(host, top).into_iter().chain([top]) {
            actions.push(DiscoveryAction::Post {
                target,
                envelope: Envelope::register(&self.local, parent == Some(target)),
            });
        }
    }

    /// Act on an internal envelope that arrived on `source`.
    pub fn handle<H: HostTree>(
        &self,
        registry: &mut PeerRegistry,
        host: &H,
        source: ChannelId,
        envelope: &Envelope,
    ) -> Vec<DiscoveryAction> {
        match envelope.internal_action() {
            Some(InternalAction::Registration) => {
                let payload: RegisterPayload = parse_or_default(envelope);
                self.on_register(registry, host, source, &envelope.from, payload.is_child)
            }
            Some(InternalAction::Deregistration) => self.on_deregister(registry, &envelope.from),
            Some(InternalAction::Distribution) => self.on_distribute(envelope),
            None => Vec::new(),
        }
    }

    fn on_register<H: HostTree>(
        &self,
        registry: &mut PeerRegistry,
        host: &H,
        source: ChannelId,
        from: &Handle,
        is_child: bool,
    ) -> Vec<DiscoveryAction> {
        // Already known on this channel: answering again would ping-pong
        // registrations forever.
        if !registry.upsert(from, source) {
            return Vec::new();
        }
        if is_child {
            registry.add_descendant(from);
        }

        let mut actions = vec![DiscoveryAction::Post {
            target: source,
            envelope: Envelope::register(&self.local, false),
        }];
        actions.extend(self.distribution(registry, host));
        actions.push(DiscoveryAction::Event(DiscoveryEvent::Registered(from.clone())));
        actions
    }

    fn on_deregister(&self, registry: &mut PeerRegistry, from: &Handle) -> Vec<DiscoveryAction> {
        if !registry.remove(from.as_str()) {
            return Vec::new();
        }
        vec![DiscoveryAction::Event(DiscoveryEvent::Deregistered(from.clone()))]
    }

    fn on_distribute(&self, envelope: &Envelope) -> Vec<DiscoveryAction> {
        if envelope.from == self.local {
            return Vec::new();
        }
        let payload: DistributePayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(from = %envelope.from, error = %e, "malformed distribution payload");
                return Vec::new();
            }
        };
        if payload.windows.is_empty() {
            return Vec::new();
        }
        vec![DiscoveryAction::Relay {
            via: envelope.from.clone(),
            ordinals: payload.windows,
        }]
    }

    /// Tell every active peer which of our direct descendants it should
    /// register with, leaving out the peer itself.
    pub fn distribution<H: HostTree>(
        &self,
        registry: &PeerRegistry,
        host: &H,
    ) -> Vec<DiscoveryAction> {
        let local_children = host.children(host.local());
        let placed: Vec<(&Handle, usize)> = registry
            .descendants()
            .iter()
            .filter_map(|handle| {
                let channel = registry.channel(handle.as_str())?;
                let ordinal = local_children.iter().position(|c| *c == channel)?;
                Some((handle, ordinal))
            })
            .collect();

        registry
            .active(host)
            .into_iter()
            .map(|(peer, channel)| {
                // The newcomer stays in the list; re-registering a known
                // peer is a no-op on the receiving side.
                let ordinals: Vec<usize> = placed
                    .iter()
                    .filter(|(handle, _)| **handle != peer)
                    .map(|(_, ordinal)| *ordinal)
                    .collect();
                DiscoveryAction::Post {
                    target: channel,
                    envelope: Envelope::distribute(&self.local, &ordinals),
                }
            })
            .collect()
    }

    /// Registrations to the children of `via_channel` at `ordinals`.
    /// Ordinals past the end are skipped.
    pub fn relay<H: HostTree>(
        &self,
        host: &H,
        via_channel: ChannelId,
        ordinals: &[usize],
    ) -> Vec<DiscoveryAction> {
        let children = host.children(via_channel);
        ordinals
            .iter()
            .filter_map(|ordinal| children.get(*ordinal).copied())
            .map(|target| DiscoveryAction::Post {
                target,
                envelope: Envelope::register(&self.local, false),
            })
            .collect()
    }

    /// Deregistrations to every active peer.
    pub fn farewell<H: HostTree>(&self, registry: &PeerRegistry, host: &H) -> Vec<DiscoveryAction> {
        registry
            .active(host)
            .into_iter()
            .map(|(peer, channel)| DiscoveryAction::Post {
                target: channel,
                envelope: Envelope::deregister(&self.local, &peer),
            })
            .collect()
    }
}

/// Decode an internal payload, falling back to the default with a warning.
fn parse_or_default<T: DeserializeOwned + Default>(envelope: &Envelope) -> T {
    match serde_json::from_value(envelope.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(
                from = %envelope.from,
                action = %envelope.action,
                error = %e,
                "malformed internal payload, using defaults"
            );
            T::default()
        }
    }
}
