/// Bounded waits on a condition, checked on a fixed cadence.
///
/// Operations addressed to a handle that has not registered yet park here
/// until the handle shows up or their timeout passes. The runtime calls
/// [`WaitRegistry::poll`] on every tick; cancelling a wait removes it, so
/// a tick that fires afterwards has nothing to act on.
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Identifies one parked wait.
pub type WaitToken = u64;

struct Wait<T> {
    started: Instant,
    timeout: Duration,
    item: T,
}

/// What became of a wait during a poll.
#[derive(Debug, PartialEq)]
pub enum WaitOutcome<T> {
    /// The condition held.
    Ready(T),
    /// The timeout passed first.
    TimedOut(T),
}

/// Parked waits, in registration order.
pub struct WaitRegistry<T> {
    next_token: WaitToken,
    waits: BTreeMap<WaitToken, Wait<T>>,
}

impl<T> WaitRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            waits: BTreeMap::new(),
        }
    }

    /// Park `item` for at most `timeout`, starting at `now`.
    pub fn register(&mut self, item: T, timeout: Duration, now: Instant) -> WaitToken {
        self.next_token += 1;
        let token = self.next_token;
        self.waits.insert(
            token,
            Wait {
                started: now,
                timeout,
                item,
            },
        );
        token
    }

    /// Tokens of every parked wait, oldest first.
    pub fn tokens(&self) -> Vec<WaitToken> {
        self.waits.keys().copied().collect()
    }

    /// Drop a wait before it settles.
    pub fn cancel(&mut self, token: WaitToken) -> Option<T> {
        self.waits.remove(&token).map(|w| w.item)
    }

    /// Settle every wait whose condition holds or whose time is up.
    ///
    /// The condition is checked first, so a wait that becomes ready on the
    /// same tick it would expire still succeeds.
    pub fn poll(&mut self, now: Instant, mut ready: impl FnMut(&T) -> bool) -> Vec<WaitOutcome<T>> {
        let settled: Vec<(WaitToken, bool)> = self
            .waits
            .iter()
            .filter_map(|(token, wait)| {
                if ready(&wait.item) {
                    Some((*token, true))
                } else if now.saturating_duration_since(wait.started) > wait.timeout {
                    Some((*token, false))
                } else {
                    None
                }
            })
            .collect();

        settled
            .into_iter()
            .filter_map(|(token, is_ready)| {
                let item = self.waits.remove(&token)?.item;
                Some(if is_ready {
                    WaitOutcome::Ready(item)
                } else {
                    WaitOutcome::TimedOut(item)
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

impl<T> Default for WaitRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn ready_wait_settles() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        reg.register("B", 500 * MS, now);

        assert!(reg.poll(now + 4 * MS, |_| false).is_empty());
        let out = reg.poll(now + 8 * MS, |h| *h == "B");
        assert_eq!(out, vec![WaitOutcome::Ready("B")]);
        assert!(reg.is_empty());
    }

    #[test]
    fn wait_times_out_strictly_after_deadline() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        reg.register(1u32, 500 * MS, now);

        assert!(reg.poll(now + 500 * MS, |_| false).is_empty());
        let out = reg.poll(now + 501 * MS, |_| false);
        assert_eq!(out, vec![WaitOutcome::TimedOut(1)]);
    }

    #[test]
    fn ready_wins_over_expiry() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        reg.register(1u32, 10 * MS, now);
        let out = reg.poll(now + 50 * MS, |_| true);
        assert_eq!(out, vec![WaitOutcome::Ready(1)]);
    }

    #[test]
    fn cancelled_wait_never_fires() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        let token = reg.register(1u32, 10 * MS, now);
        assert_eq!(reg.cancel(token), Some(1));
        assert!(reg.poll(now + 50 * MS, |_| true).is_empty());
        assert_eq!(reg.cancel(token), None);
    }

    #[test]
    fn tokens_list_parked_waits() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        let first = reg.register(1u32, 10 * MS, now);
        let second = reg.register(2u32, 10 * MS, now);
        assert_eq!(reg.tokens(), vec![first, second]);
        reg.cancel(first);
        assert_eq!(reg.tokens(), vec![second]);
    }

    #[test]
    fn settles_in_registration_order() {
        let now = Instant::now();
        let mut reg = WaitRegistry::new();
        reg.register(3u32, 10 * MS, now);
        reg.register(1u32, 10 * MS, now);
        reg.register(2u32, 1000 * MS, now);

        let out = reg.poll(now + 20 * MS, |_| false);
        assert_eq!(out, vec![WaitOutcome::TimedOut(3), WaitOutcome::TimedOut(1)]);
        assert_eq!(reg.len(), 1);
    }
}
