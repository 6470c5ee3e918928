use crate::common::{elapsed_s, ms, rtt_stats, Sim, TreeShape};
use crate::events::*;
use mbus_protocol::Callback;
use serde_json::json;
use std::time::Instant;

pub struct PingConfig {
    pub count: u32,
}

pub async fn run(shape: TreeShape, config: PingConfig, start: Instant) -> anyhow::Result<()> {
    let sim = Sim::build(&shape)?;
    emit(&EventStarted::new("ping", shape.depth, shape.fanout, sim.contexts.len()));
    eprintln!(
        "Ping mode → {} contexts, {} rounds",
        sim.contexts.len(),
        config.count
    );

    for context in &sim.contexts[1..] {
        let name = context.handle.to_string();
        context
            .bus
            .add_callback(
                "ping",
                Callback::new(move |_, payload, _| {
                    json!({"pong": payload.get("seq").cloned().unwrap_or_default(), "from": name})
                        .into()
                }),
            )
            .await?;
    }

    sim.converge(&shape, start).await?;

    let targets = sim.peers();
    let mut rtts = Vec::new();
    let mut failed = 0u32;

    for seq in 1..=config.count {
        for target in &targets {
            let sent = Instant::now();
            let result = sim.root().send_request(target, "ping", json!({"seq": seq})).await;
            let rtt_ms = ms(sent.elapsed());

            let error = match result {
                Ok(_) => {
                    rtts.push(rtt_ms);
                    None
                }
                Err(e) => {
                    failed += 1;
                    if failed <= 5 {
                        tracing::warn!(%target, seq, error = %e, "ping failed");
                    }
                    Some(e.to_string())
                }
            };

            emit(&EventPing {
                event: "ping",
                seq,
                target: target.to_string(),
                ok: error.is_none(),
                rtt_ms,
                error,
                elapsed_s: elapsed_s(start),
            });
        }
    }

    let (rtt_min_ms, rtt_max_ms, rtt_avg_ms) = rtt_stats(&rtts);
    let successful = rtts.len() as u32;
    emit(&EventPingSummary {
        event: "summary",
        rounds: config.count,
        total_pings: successful + failed,
        successful,
        failed,
        rtt_min_ms,
        rtt_max_ms,
        rtt_avg_ms,
        elapsed_s: elapsed_s(start),
    });

    eprintln!(
        "\n  ping: {successful}/{} answered, avg RTT {rtt_avg_ms:.2}ms",
        successful + failed
    );

    sim.shutdown().await;
    Ok(())
}
