use crate::common::{elapsed_s, ms, Sim, TreeShape};
use crate::events::*;
use mbus_protocol::{BroadcastOptions, Callback, Handle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;
use std::time::{Duration, Instant};

pub struct FanoutConfig {
    pub silent: u32,
    pub partial: bool,
    pub timeout_ms: u64,
    pub seed: u64,
}

/// Pick `count` peers that will not answer.
fn pick_silent(peers: &[Handle], count: u32, seed: u64) -> Vec<Handle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut shuffled = peers.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled.truncate(count as usize);
    shuffled
}

pub async fn run(shape: TreeShape, config: FanoutConfig, start: Instant) -> anyhow::Result<()> {
    let sim = Sim::build(&shape)?;
    emit(&EventStarted::new("fanout", shape.depth, shape.fanout, sim.contexts.len()));

    let silent = pick_silent(&sim.peers(), config.silent, config.seed);
    eprintln!(
        "Fanout mode → {} peers, {} silent (seed {}), {}",
        sim.contexts.len() - 1,
        silent.len(),
        config.seed,
        if config.partial { "partial" } else { "strict" }
    );

    // Silent peers have no callback, so their requests are dropped.
    for context in &sim.contexts[1..] {
        if silent.contains(&context.handle) {
            continue;
        }
        context
            .bus
            .add_callback(
                "survey",
                Callback::new(|_, _, from| json!({"seen": from}).into()),
            )
            .await?;
    }

    sim.converge(&shape, start).await?;

    let options = BroadcastOptions::new()
        .allow_partial(config.partial)
        .timeout(Duration::from_millis(config.timeout_ms));
    let target_count = sim.root().active_handles().await?.len();

    let sent = Instant::now();
    let outcome = sim.root().send_request_to_all("survey", json!({}), options).await;
    let elapsed_ms = ms(sent.elapsed());

    let (answered, timed_out, error) = match &outcome {
        Ok(results) => (
            results.iter().filter(|r| r.is_answered()).count(),
            results.iter().filter(|r| r.timeout).count(),
            None,
        ),
        Err(e) => (0, 0, Some(e.to_string())),
    };

    emit(&EventFanoutResult {
        event: "fanout_result",
        policy: if config.partial { "partial" } else { "strict" },
        target_count,
        silent: silent.iter().map(|h| h.to_string()).collect(),
        answered,
        timed_out,
        error: error.clone(),
        elapsed_ms,
        elapsed_s: elapsed_s(start),
    });

    match error {
        Some(e) => tracing::warn!(elapsed_ms, error = %e, "fanout failed"),
        None => eprintln!(
            "\n  fanout: {answered}/{target_count} answered, {timed_out} timed out, {elapsed_ms:.1}ms"
        ),
    }

    sim.shutdown().await;
    Ok(())
}
