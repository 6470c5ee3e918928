use crate::events::{emit, EventConverged};
use mbus_protocol::{BusConfig, BusHandle, DebugConfig, Handle, MessagingBus, DEFAULT_HANDLE};
use mbus_transport::{ChannelId, ContextNode, ContextTree, TreeConfig};
use std::time::{Duration, Instant};

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Shape of the simulated tree: a full tree of `fanout` children per
/// context, `depth` levels below the root.
#[derive(Debug, Clone, Copy)]
pub struct TreeShape {
    pub depth: u32,
    pub fanout: u32,
    pub settle_ms: u64,
}

impl TreeShape {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// One context of the simulation and the bus running inside it.
pub struct SimContext {
    pub handle: Handle,
    pub channel: ChannelId,
    pub parent: Option<ChannelId>,
    pub bus: BusHandle,
}

/// A whole simulated tree. `contexts[0]` is the root.
pub struct Sim {
    pub tree: ContextTree,
    pub contexts: Vec<SimContext>,
}

impl Sim {
    /// Open every context of `shape` and spawn a bus in each. Handles
    /// follow the tree path: `main`, `main.0`, `main.0.2`, ...
    pub fn build(shape: &TreeShape) -> anyhow::Result<Self> {
        let tree = ContextTree::new(TreeConfig::new().max_depth(shape.depth as usize));
        let mut sim = Self {
            tree: tree.clone(),
            contexts: Vec::new(),
        };

        let root = tree.open_root();
        let root_id = root.id();
        sim.spawn(root, DEFAULT_HANDLE.to_string(), None);

        let mut frontier = vec![(root_id, DEFAULT_HANDLE.to_string())];
        for _ in 0..shape.depth {
            let mut next = Vec::new();
            for (parent, name) in frontier {
                for i in 0..shape.fanout {
                    let handle = format!("{name}.{i}");
                    let channel = sim.open_child(parent, handle.clone())?;
                    next.push((channel, handle));
                }
            }
            frontier = next;
        }

        Ok(sim)
    }

    pub fn root(&self) -> &BusHandle {
        &self.contexts[0].bus
    }

    /// Handles of every context but the root.
    pub fn peers(&self) -> Vec<Handle> {
        self.contexts[1..].iter().map(|c| c.handle.clone()).collect()
    }

    /// Open a child of `parent` running a bus named `handle`.
    pub fn open_child(&mut self, parent: ChannelId, handle: String) -> anyhow::Result<ChannelId> {
        let node = self.tree.open_child(parent)?;
        let channel = node.id();
        self.spawn(node, handle, Some(parent));
        Ok(channel)
    }

    fn spawn(&mut self, node: ContextNode, handle: String, parent: Option<ChannelId>) {
        let channel = node.id();
        let config = BusConfig {
            debug: DebugConfig::from_env(),
            ..BusConfig::new(handle.as_str())
        };
        let bus = MessagingBus::spawn(node, config);
        self.contexts.push(SimContext {
            handle: Handle::from(handle),
            channel,
            parent,
            bus,
        });
    }

    /// Wait until the root knows every other context, then report it.
    pub async fn converge(&self, shape: &TreeShape, start: Instant) -> anyhow::Result<()> {
        let expected = self.contexts.len() - 1;
        let took = wait_until(self.root(), shape.settle(), |peers| peers.len() >= expected).await?;
        let peers = self.root().active_handles().await?.len();

        emit(&EventConverged {
            event: "converged",
            peers,
            expected,
            converge_ms: took.map(ms).unwrap_or(-1.0),
            elapsed_s: elapsed_s(start),
        });

        match took {
            Some(took) => {
                tracing::info!(peers, converge_ms = ms(took), "discovery converged");
                Ok(())
            }
            None => anyhow::bail!("discovery did not converge: {peers}/{expected} peers"),
        }
    }

    /// Destroy every bus still running.
    pub async fn shutdown(self) {
        for context in &self.contexts {
            if !context.bus.is_closed() {
                context.bus.destroy().await;
            }
        }
    }
}

/// Poll `bus`'s active peers until `done` holds. Returns how long it
/// took, or `None` once `limit` has passed.
pub async fn wait_until<F>(
    bus: &BusHandle,
    limit: Duration,
    mut done: F,
) -> anyhow::Result<Option<Duration>>
where
    F: FnMut(&[Handle]) -> bool,
{
    let begin = Instant::now();
    loop {
        let peers = bus.active_handles().await?;
        if done(&peers) {
            return Ok(Some(begin.elapsed()));
        }
        if begin.elapsed() >= limit {
            return Ok(None);
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}

/// Min, max and average of a set of samples (all zero when empty).
pub fn rtt_stats(rtts: &[f64]) -> (f64, f64, f64) {
    if rtts.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
    let max = rtts.iter().copied().fold(0.0f64, f64::max);
    let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
    (min, max, avg)
}

pub fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_of_samples() {
        assert_eq!(rtt_stats(&[]), (0.0, 0.0, 0.0));
        assert_eq!(rtt_stats(&[2.0, 4.0, 6.0]), (2.0, 6.0, 4.0));
    }

    #[tokio::test]
    async fn build_names_contexts_by_path() {
        let shape = TreeShape {
            depth: 2,
            fanout: 2,
            settle_ms: 1000,
        };
        let sim = Sim::build(&shape).unwrap();
        let names: Vec<_> = sim.contexts.iter().map(|c| c.handle.to_string()).collect();
        assert_eq!(
            names,
            ["main", "main.0", "main.1", "main.0.0", "main.0.1", "main.1.0", "main.1.1"]
        );
        assert_eq!(sim.contexts[3].parent, Some(sim.contexts[1].channel));
        sim.shutdown().await;
    }

    #[tokio::test]
    async fn small_tree_converges() {
        let shape = TreeShape {
            depth: 1,
            fanout: 3,
            settle_ms: 2000,
        };
        let sim = Sim::build(&shape).unwrap();
        sim.converge(&shape, Instant::now()).await.unwrap();
        let mut peers = sim.root().active_handles().await.unwrap();
        peers.sort();
        assert_eq!(peers, sim.peers());
        sim.shutdown().await;
    }
}
