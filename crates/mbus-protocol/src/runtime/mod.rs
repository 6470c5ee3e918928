/// Bus runtime — ties discovery, routing and correlation into a live
/// event loop.
///
/// The runtime owns the host handle (transport) and all bus state. It
/// exposes a channel-based `BusHandle` so the application never touches
/// envelopes or the peer registry directly.
pub(crate) mod effect;
pub(crate) mod executor;
mod r#loop;
pub(crate) mod state;
pub mod transport;

use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{
    fan_out_messages, fan_out_requests, filter_targets, BroadcastOptions, RequestResult,
};
use crate::callbacks::Callback;
use crate::correlation::{AckReceiver, ResponseReceiver};
use crate::debug::DebugConfig;
use crate::error::BusError;
use crate::types::{
    is_reserved_action, ChannelId, Handle, RequestResponse, DEFAULT_BROADCAST_SETTLE,
    DEFAULT_HANDLE, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RESOLVE_TIMEOUT,
};

pub use transport::{HostTree, Transport};

/// Environment variable naming the local handle.
pub const HANDLE_ENV: &str = "MBUS_HANDLE";

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for one bus instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// The handle this bus registers under.
    pub handle: Handle,
    /// Default time a request waits for its response.
    pub request_timeout: Duration,
    /// How long an operation waits for an unknown handle to register.
    pub resolve_timeout: Duration,
    /// How long a broadcast request waits when no peer is known yet.
    pub broadcast_settle: Duration,
    /// Cadence at which pending waits are re-checked.
    pub poll_interval: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Traffic logging.
    pub debug: DebugConfig,
    /// Seed for correlation codes. `None` draws from the OS.
    pub correlation_seed: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            handle: Handle::from(DEFAULT_HANDLE),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            broadcast_settle: DEFAULT_BROADCAST_SETTLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_buffer: 64,
            debug: DebugConfig::default(),
            correlation_seed: None,
        }
    }
}

impl BusConfig {
    /// Defaults with the given handle.
    pub fn new(handle: impl Into<Handle>) -> Self {
        Self {
            handle: handle.into(),
            ..Default::default()
        }
    }

    /// Defaults, with the handle from `MBUS_HANDLE` and logging from
    /// `MBUS_DEBUG` / `MBUS_DEBUG_LEVEL`.
    pub fn from_env() -> Self {
        let handle = std::env::var(HANDLE_ENV)
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HANDLE.to_string());
        Self {
            handle: Handle::from(handle),
            debug: DebugConfig::from_env(),
            ..Default::default()
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Reply slot for commands that can fail.
pub(crate) type CommandReply<T> = oneshot::Sender<Result<T, BusError>>;

/// Commands the application sends to the runtime event loop.
pub(crate) enum BusCommand {
    AddCallback {
        action: String,
        callback: Callback,
        reply: oneshot::Sender<()>,
    },
    RemoveCallback {
        action: String,
        callback: Callback,
        reply: oneshot::Sender<bool>,
    },
    SendMessage {
        handle: Handle,
        action: String,
        payload: Value,
        reply: CommandReply<AckReceiver>,
    },
    SendMessageToChannel {
        channel: ChannelId,
        handle: Option<Handle>,
        action: String,
        payload: Value,
        reply: CommandReply<AckReceiver>,
    },
    SendRequest {
        handle: Handle,
        action: String,
        payload: Value,
        reply: CommandReply<(Handle, ResponseReceiver)>,
    },
    SendRequestToChannel {
        channel: ChannelId,
        handle: Option<Handle>,
        action: String,
        payload: Value,
        reply: CommandReply<(Handle, ResponseReceiver)>,
    },
    ActiveHandles {
        direct_descendants_only: bool,
        reply: oneshot::Sender<Vec<Handle>>,
    },
    DirectDescendants {
        reply: oneshot::Sender<Vec<Handle>>,
    },
    ParentHandle {
        reply: CommandReply<Handle>,
    },
    /// Deregister from every peer and stop.
    Destroy,
}

// ── BusHandle (app-facing API) ───────────────────────────────────────

/// Handle to a running bus.
///
/// Cheap to clone. Every method is a round trip through the event loop.
#[derive(Clone)]
pub struct BusHandle {
    cmd_tx: mpsc::Sender<BusCommand>,
    local: Handle,
    request_timeout: Duration,
    broadcast_settle: Duration,
}

impl BusHandle {
    /// The handle this bus registered under.
    pub fn local_handle(&self) -> &Handle {
        &self.local
    }

    async fn command(&self, cmd: BusCommand) -> Result<(), BusError> {
        self.cmd_tx.send(cmd).await.map_err(|_| BusError::Shutdown)
    }

    async fn query<T>(&self, cmd: BusCommand, rx: oneshot::Receiver<T>) -> Result<T, BusError> {
        self.command(cmd).await?;
        rx.await.map_err(|_| BusError::Shutdown)
    }

    // ── Callbacks ──────────────────────────────

    /// Bind `callback` to `action`. Effective once this returns.
    pub async fn add_callback(&self, action: &str, callback: Callback) -> Result<(), BusError> {
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::AddCallback {
            action: action.to_string(),
            callback,
            reply: tx,
        };
        self.query(cmd, rx).await
    }

    /// Remove one binding of `callback` to `action`. Returns whether one
    /// existed.
    pub async fn remove_callback(&self, action: &str, callback: &Callback) -> Result<bool, BusError> {
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::RemoveCallback {
            action: action.to_string(),
            callback: callback.clone(),
            reply: tx,
        };
        self.query(cmd, rx).await
    }

    // ── Messages ───────────────────────────────

    /// Send a message to `handle` and wait for its acknowledgement.
    ///
    /// Waits up to the resolve timeout for `handle` to register. There is
    /// no limit on how long the acknowledgement may take.
    pub async fn send_message(
        &self,
        handle: impl Into<Handle>,
        action: &str,
        payload: Value,
    ) -> Result<(), BusError> {
        check_action(action)?;
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::SendMessage {
            handle: handle.into(),
            action: action.to_string(),
            payload,
            reply: tx,
        };
        let ack = self.query(cmd, rx).await??;
        ack.await.map_err(|_| BusError::Shutdown)?
    }

    /// Send a message straight to a channel. Without `handle`, the peer
    /// registered on `channel` is addressed.
    pub async fn send_message_to_channel(
        &self,
        channel: ChannelId,
        action: &str,
        payload: Value,
        handle: Option<Handle>,
    ) -> Result<(), BusError> {
        check_action(action)?;
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::SendMessageToChannel {
            channel,
            handle,
            action: action.to_string(),
            payload,
            reply: tx,
        };
        let ack = self.query(cmd, rx).await??;
        ack.await.map_err(|_| BusError::Shutdown)?
    }

    /// Send a message to every active peer; fails if any send fails.
    pub async fn send_message_to_all(
        &self,
        action: &str,
        payload: Value,
        direct_descendants_only: bool,
    ) -> Result<(), BusError> {
        check_action(action)?;
        let targets = self.active(direct_descendants_only).await?;
        fan_out_messages(targets, |handle| {
            self.send_message(handle, action, payload.clone())
        })
        .await
    }

    /// Send a message to every active peer whose handle matches `pattern`.
    pub async fn send_filtered_message(
        &self,
        pattern: &Regex,
        action: &str,
        payload: Value,
        direct_descendants_only: bool,
    ) -> Result<(), BusError> {
        check_action(action)?;
        let targets = filter_targets(self.active(direct_descendants_only).await?, Some(pattern));
        fan_out_messages(targets, |handle| {
            self.send_message(handle, action, payload.clone())
        })
        .await
    }

    // ── Requests ───────────────────────────────

    /// Request with the default timeout.
    pub async fn send_request(
        &self,
        handle: impl Into<Handle>,
        action: &str,
        payload: Value,
    ) -> Result<RequestResponse, BusError> {
        self.send_request_with_timeout(handle, action, payload, self.request_timeout)
            .await
    }

    /// Send a request to `handle` and wait at most `timeout` for the
    /// response. The clock starts once the request is posted.
    pub async fn send_request_with_timeout(
        &self,
        handle: impl Into<Handle>,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<RequestResponse, BusError> {
        check_action(action)?;
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::SendRequest {
            handle: handle.into(),
            action: action.to_string(),
            payload,
            reply: tx,
        };
        let (handle, response) = self.query(cmd, rx).await??;
        await_response(handle, action, response, timeout).await
    }

    /// Send a request straight to a channel. Without `handle`, the peer
    /// registered on `channel` is addressed.
    pub async fn send_request_to_channel(
        &self,
        channel: ChannelId,
        action: &str,
        payload: Value,
        handle: Option<Handle>,
        timeout: Option<Duration>,
    ) -> Result<RequestResponse, BusError> {
        check_action(action)?;
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::SendRequestToChannel {
            channel,
            handle,
            action: action.to_string(),
            payload,
            reply: tx,
        };
        let (handle, response) = self.query(cmd, rx).await??;
        await_response(handle, action, response, timeout.unwrap_or(self.request_timeout)).await
    }

    /// Request every active peer at once.
    ///
    /// When no peer is known yet, waits the settle period once before
    /// picking targets. Succeeds only if at least one peer answered with
    /// something truthy.
    pub async fn send_request_to_all(
        &self,
        action: &str,
        payload: Value,
        options: BroadcastOptions,
    ) -> Result<Vec<RequestResult>, BusError> {
        self.broadcast_request(None, action, payload, options).await
    }

    /// Like [`send_request_to_all`](Self::send_request_to_all), restricted
    /// to handles matching `pattern`.
    pub async fn send_filtered_request(
        &self,
        pattern: &Regex,
        action: &str,
        payload: Value,
        options: BroadcastOptions,
    ) -> Result<Vec<RequestResult>, BusError> {
        self.broadcast_request(Some(pattern), action, payload, options)
            .await
    }

    async fn broadcast_request(
        &self,
        pattern: Option<&Regex>,
        action: &str,
        payload: Value,
        options: BroadcastOptions,
    ) -> Result<Vec<RequestResult>, BusError> {
        check_action(action)?;
        if self.active(false).await?.is_empty() {
            tokio::time::sleep(self.broadcast_settle).await;
        }
        let targets = filter_targets(self.active(options.direct_descendants_only).await?, pattern);
        let timeout = options.timeout.unwrap_or(self.request_timeout);
        fan_out_requests(targets, options.policy, |handle| {
            self.send_request_with_timeout(handle, action, payload.clone(), timeout)
        })
        .await
    }

    // ── Queries ────────────────────────────────

    async fn active(&self, direct_descendants_only: bool) -> Result<Vec<Handle>, BusError> {
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand::ActiveHandles {
            direct_descendants_only,
            reply: tx,
        };
        self.query(cmd, rx).await
    }

    /// Handles of every live peer, ourselves excluded.
    pub async fn active_handles(&self) -> Result<Vec<Handle>, BusError> {
        self.active(false).await
    }

    /// Handles of live peers that registered as our direct children.
    pub async fn active_descendants(&self) -> Result<Vec<Handle>, BusError> {
        self.active(true).await
    }

    /// Every peer that registered as our direct child, live or not.
    pub async fn direct_descendants(&self) -> Result<Vec<Handle>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.query(BusCommand::DirectDescendants { reply: tx }, rx)
            .await
    }

    /// The handle registered from our parent context.
    pub async fn parent_handle(&self) -> Result<Handle, BusError> {
        let (tx, rx) = oneshot::channel();
        self.query(BusCommand::ParentHandle { reply: tx }, rx)
            .await?
    }

    /// Deregister from every peer and stop the bus.
    pub async fn destroy(&self) {
        let _ = self.cmd_tx.send(BusCommand::Destroy).await;
    }

    /// Whether the event loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

fn check_action(action: &str) -> Result<(), BusError> {
    if is_reserved_action(action) {
        return Err(BusError::ReservedAction {
            action: action.to_string(),
        });
    }
    Ok(())
}

async fn await_response(
    handle: Handle,
    action: &str,
    response: ResponseReceiver,
    timeout: Duration,
) -> Result<RequestResponse, BusError> {
    match tokio::time::timeout(timeout, response).await {
        Ok(Ok(Ok(response))) => Ok(RequestResponse { response, handle }),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(BusError::Shutdown),
        Err(_) => Err(BusError::Timeout {
            handle,
            action: action.to_string(),
        }),
    }
}

// ── MessagingBus ─────────────────────────────────────────────────────

/// The bus — spawn it on a context and talk to it through the handle.
pub struct MessagingBus;

impl MessagingBus {
    /// Start a bus on `transport`.
    ///
    /// Spawns the event loop as a tokio task. The bus announces itself to
    /// every reachable context right away.
    pub fn spawn<T: Transport + 'static>(transport: T, config: BusConfig) -> BusHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<BusCommand>(config.command_buffer.max(1));

        let handle = BusHandle {
            cmd_tx,
            local: config.handle.clone(),
            request_timeout: config.request_timeout,
            broadcast_settle: config.broadcast_settle,
        };

        let state = state::BusState::new(config);
        tokio::spawn(r#loop::bus_loop(transport, state, cmd_rx));

        handle
    }
}
