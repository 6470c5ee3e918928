/// Known peers: handle → channel, plus which of them are our direct
/// descendants.
///
/// A peer only counts as active while its channel is live and it is not
/// the local bus itself. Liveness is asked of the host at query time.
use std::collections::BTreeMap;

use crate::runtime::transport::HostTree;
use crate::types::{ChannelId, Handle};

pub struct PeerRegistry {
    local: Handle,
    peers: BTreeMap<Handle, ChannelId>,
    /// Peers that registered as our direct children, in arrival order.
    descendants: Vec<Handle>,
}

impl PeerRegistry {
    pub fn new(local: Handle) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
            descendants: Vec::new(),
        }
    }

    pub fn local(&self) -> &Handle {
        &self.local
    }

    /// The channel recorded for `handle`, live or not.
    pub fn channel(&self, handle: &str) -> Option<ChannelId> {
        self.peers.get(handle).copied()
    }

    /// Record `handle` on `channel`. Returns false if that exact entry was
    /// already present.
    pub fn upsert(&mut self, handle: &Handle, channel: ChannelId) -> bool {
        self.peers.insert(handle.clone(), channel) != Some(channel)
    }

    /// Forget `handle` entirely. Returns whether it was known.
    pub fn remove(&mut self, handle: &str) -> bool {
        self.descendants.retain(|d| d != handle);
        self.peers.remove(handle).is_some()
    }

    pub fn add_descendant(&mut self, handle: &Handle) -> bool {
        if self.is_descendant(handle.as_str()) {
            return false;
        }
        self.descendants.push(handle.clone());
        true
    }

    pub fn is_descendant(&self, handle: &str) -> bool {
        self.descendants.iter().any(|d| d == handle)
    }

    /// Direct descendants as recorded, live or not.
    pub fn descendants(&self) -> &[Handle] {
        &self.descendants
    }

    /// Peers whose channel is live, excluding ourselves.
    pub fn active<H: HostTree>(&self, host: &H) -> Vec<(Handle, ChannelId)> {
        self.peers
            .iter()
            .filter(|(handle, channel)| **handle != self.local && host.is_live(**channel))
            .map(|(handle, channel)| (handle.clone(), *channel))
            .collect()
    }

    /// The live channel of an active peer.
    pub fn active_channel<H: HostTree>(&self, handle: &str, host: &H) -> Option<ChannelId> {
        if handle == self.local.as_str() {
            return None;
        }
        self.channel(handle).filter(|c| host.is_live(*c))
    }

    /// The active peer registered on `channel`.
    pub fn handle_on<H: HostTree>(&self, channel: ChannelId, host: &H) -> Option<Handle> {
        if !host.is_live(channel) {
            return None;
        }
        self.peers
            .iter()
            .find(|(handle, c)| **c == channel && **handle != self.local)
            .map(|(handle, _)| handle.clone())
    }

    /// Number of recorded entries, the local self-registration included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::mock::{ch, MockHost};

    fn h(name: &str) -> Handle {
        Handle::from(name)
    }

    #[test]
    fn upsert_reports_changes() {
        let mut reg = PeerRegistry::new(h("A"));
        assert!(reg.upsert(&h("B"), ch(2)));
        assert!(!reg.upsert(&h("B"), ch(2)));
        assert!(reg.upsert(&h("B"), ch(3)));
        assert_eq!(reg.channel("B"), Some(ch(3)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn active_excludes_self_and_dead() {
        let host = MockHost::new(ch(1));
        let mut reg = PeerRegistry::new(h("A"));
        reg.upsert(&h("A"), ch(1));
        reg.upsert(&h("B"), ch(2));
        reg.upsert(&h("C"), ch(3));
        host.kill(ch(3));

        assert_eq!(reg.active(&host), vec![(h("B"), ch(2))]);
        assert_eq!(reg.active_channel("B", &host), Some(ch(2)));
        assert_eq!(reg.active_channel("C", &host), None);
        assert_eq!(reg.active_channel("A", &host), None);
        assert_eq!(reg.channel("C"), Some(ch(3)));
    }

    #[test]
    fn handle_on_channel() {
        let host = MockHost::new(ch(1));
        let mut reg = PeerRegistry::new(h("A"));
        reg.upsert(&h("A"), ch(1));
        reg.upsert(&h("B"), ch(2));

        assert_eq!(reg.handle_on(ch(2), &host), Some(h("B")));
        assert_eq!(reg.handle_on(ch(1), &host), None);
        assert_eq!(reg.handle_on(ch(9), &host), None);
        host.kill(ch(2));
        assert_eq!(reg.handle_on(ch(2), &host), None);
    }

    #[test]
    fn remove_drops_descendant() {
        let mut reg = PeerRegistry::new(h("A"));
        reg.upsert(&h("B"), ch(2));
        assert!(reg.add_descendant(&h("B")));
        assert!(!reg.add_descendant(&h("B")));

        assert!(reg.remove("B"));
        assert!(!reg.is_descendant("B"));
        assert!(reg.descendants().is_empty());
        assert!(!reg.remove("B"));
    }
}
