use crate::common::{elapsed_s, ms, wait_until, Sim, TreeShape};
use crate::events::*;
use std::time::Instant;

pub struct ChurnConfig {
    pub rounds: u32,
}

pub async fn run(shape: TreeShape, config: ChurnConfig, start: Instant) -> anyhow::Result<()> {
    if shape.depth == 0 || shape.fanout == 0 {
        anyhow::bail!("churn needs at least one leaf (--depth and --fanout > 0)");
    }

    let mut sim = Sim::build(&shape)?;
    emit(&EventStarted::new("churn", shape.depth, shape.fanout, sim.contexts.len()));
    sim.converge(&shape, start).await?;

    let mut clean_rounds = 0u32;

    for round in 1..=config.rounds {
        let Some(leaf) = sim.contexts.pop() else {
            anyhow::bail!("leaf context vanished");
        };
        let Some(parent) = leaf.parent else {
            anyhow::bail!("leaf {} has no parent", leaf.handle);
        };
        let handle = leaf.handle;

        sim.tree.close(leaf.channel)?;
        let gone = wait_until(sim.root(), shape.settle(), |peers| !peers.contains(&handle)).await?;

        sim.open_child(parent, handle.to_string())?;
        let back = wait_until(sim.root(), shape.settle(), |peers| peers.contains(&handle)).await?;

        if gone.is_some() && back.is_some() {
            clean_rounds += 1;
        } else {
            tracing::warn!(
                round,
                %handle,
                deregistered = gone.is_some(),
                reregistered = back.is_some(),
                "churn round left the root out of date"
            );
        }

        emit(&EventChurnRound {
            event: "churn_round",
            round,
            handle: handle.to_string(),
            deregistered: gone.is_some(),
            deregister_ms: gone.map(ms).unwrap_or(-1.0),
            reregistered: back.is_some(),
            reregister_ms: back.map(ms).unwrap_or(-1.0),
            elapsed_s: elapsed_s(start),
        });
    }

    emit(&EventChurnSummary {
        event: "summary",
        rounds: config.rounds,
        clean_rounds,
        elapsed_s: elapsed_s(start),
    });
    eprintln!("\n  churn: {clean_rounds}/{} clean rounds", config.rounds);

    sim.shutdown().await;
    Ok(())
}
