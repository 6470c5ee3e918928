//! The bus event loop.
//!
//! One task per bus. Everything that touches bus state happens here, so
//! state needs no locking: host events, application commands, callback
//! answers and wait ticks are all serialized through one `select!`.

use mbus_transport::HostEvent;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::effect::{BusEffect, Responder};
use super::executor::execute_effects;
use super::state::BusState;
use super::transport::Transport;
use super::BusCommand;

pub(super) async fn bus_loop<T: Transport>(
    mut transport: T,
    mut state: BusState,
    mut cmd_rx: mpsc::Receiver<BusCommand>,
) {
    // Callback answers come back through here (deferred ones from spawned
    // tasks). The loop keeps a sender, so this never closes.
    let (respond_tx, mut respond_rx) = mpsc::unbounded_channel::<Responder>();

    let mut poll = tokio::time::interval(state.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await;

    tracing::debug!(handle = %state.local, channel = %transport.local(), "bus started");
    let effects = state.announce(&transport, Instant::now());
    run(effects, &transport, &mut state, &respond_tx);

    // Dropping every handle must not stop the bus; only teardown does.
    let mut commands_open = true;

    loop {
        let effects = tokio::select! {
            event = transport.next_event() => match event {
                Some(HostEvent::Inbound(inbound)) => {
                    state.handle_inbound(&transport, inbound.source, inbound.data, Instant::now())
                }
                Some(HostEvent::Teardown) | None => {
                    let effects = state.teardown(&transport);
                    run(effects, &transport, &mut state, &respond_tx);
                    break;
                }
            },
            cmd = cmd_rx.recv(), if commands_open => match cmd {
                Some(BusCommand::Destroy) => {
                    let effects = state.teardown(&transport);
                    run(effects, &transport, &mut state, &respond_tx);
                    break;
                }
                Some(cmd) => state.handle_command(&transport, cmd, Instant::now()),
                None => {
                    commands_open = false;
                    Vec::new()
                }
            },
            Some(responder) = respond_rx.recv() => {
                state.handle_responder(&transport, responder, Instant::now())
            }
            _ = poll.tick(), if state.has_waits() => {
                state.tick_waits(&transport, Instant::now())
            }
        };

        run(effects, &transport, &mut state, &respond_tx);
    }

    tracing::debug!(handle = %state.local, "bus stopped");
}

/// Execute effects and hand refused posts back to the state.
fn run<T: Transport>(
    effects: Vec<BusEffect>,
    transport: &T,
    state: &mut BusState,
    respond_tx: &mpsc::UnboundedSender<Responder>,
) {
    for failure in execute_effects(effects, transport, respond_tx) {
        state.handle_post_failure(failure);
    }
}
