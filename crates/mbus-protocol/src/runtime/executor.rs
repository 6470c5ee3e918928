//! Effect executor — the only place that touches the host or runs
//! application code.
//!
//! - Post -> transport.post()
//! - Invoke -> every bound callback, deferred replies spawned
//! - Respond -> the bound callback, its answer sent back to the loop

use tokio::sync::mpsc;

use crate::callbacks::Reply;
use crate::types::is_truthy;

use super::effect::{BusEffect, PostFailure, Responder};
use super::transport::Transport;

/// Execute `effects` in order. Returns the posts the host refused.
pub(super) fn execute_effects<T: Transport>(
    effects: Vec<BusEffect>,
    transport: &T,
    respond_tx: &mpsc::UnboundedSender<Responder>,
) -> Vec<PostFailure> {
    let mut failures = Vec::new();
    for effect in effects {
        match effect {
            BusEffect::Post { target, envelope } => {
                let value = match envelope.to_value() {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!(%target, error = %e, "encode envelope failed");
                        continue;
                    }
                };
                if let Err(error) = transport.post(target, value) {
                    failures.push(PostFailure {
                        target,
                        envelope,
                        error,
                    });
                }
            }
            BusEffect::Invoke {
                callbacks,
                action,
                payload,
                from,
            } => {
                for callback in callbacks {
                    if let Reply::Deferred(fut) = callback.call(&action, &payload, &from) {
                        tokio::spawn(fut);
                    }
                }
            }
            BusEffect::Respond {
                callback,
                action,
                payload,
                from,
                code,
            } => match callback.call(&action, &payload, &from) {
                Reply::Value(value) if is_truthy(&value) => {
                    let _ = respond_tx.send(Responder {
                        to: from,
                        action,
                        payload: value,
                        code,
                    });
                }
                Reply::Value(_) | Reply::None => {
                    tracing::warn!(%from, %action, "request callback returned nothing to send back");
                }
                Reply::Deferred(fut) => {
                    let respond_tx = respond_tx.clone();
                    tokio::spawn(async move {
                        let value = fut.await;
                        let _ = respond_tx.send(Responder {
                            to: from,
                            action,
                            payload: value,
                            code,
                        });
                    });
                }
            },
        }
    }
    failures
}
