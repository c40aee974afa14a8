//! Per-connection control loop.
//!
//! A connection moves through `Connecting -> Open -> Draining -> Closed`.
//! [`Lifecycle::open`] registers the handle (`Open`), [`Lifecycle::run`] reads
//! until a [`Termination`] is observed (`Draining`), issues the close that
//! termination calls for and then runs the single cleanup step (`Closed`).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{Stream, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    envelope::{DecodeError, Envelope},
    registry::Registry,
};

pub const IDLE_TIMEOUT_REASON: &str = "Idle timeout";
pub const READ_ERROR_REASON: &str = "Read error";
pub const SHUTDOWN_REASON: &str = "Server shutting down";
pub const SAFETY_NET_REASON: &str = "Internal server error occurred";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Longest a single read may wait for a frame.
    pub idle_timeout: Duration,
    /// Bound on each close attempt.
    pub close_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("transport read failed: {0}")]
    Transport(#[source] axum::Error),
}

/// Why a read loop stopped.
#[derive(Debug)]
pub enum Termination {
    /// Peer sent a normal or going-away close frame.
    Graceful { code: u16 },
    /// No frame arrived within the idle timeout.
    IdleTimeout,
    /// The shutdown token fired.
    Cancelled,
    /// Peer closed with any other code, or vanished without a close frame.
    PeerAbnormal { code: u16 },
    /// The relay could not make sense of what it read.
    ReadError(ReadError),
}

impl Termination {
    /// Close frame the relay sends for this termination, if any.
    pub fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            Termination::Graceful { .. } | Termination::PeerAbnormal { .. } => None,
            Termination::IdleTimeout => Some((close_code::POLICY, IDLE_TIMEOUT_REASON)),
            Termination::Cancelled => Some((close_code::NORMAL, SHUTDOWN_REASON)),
            Termination::ReadError(_) => Some((close_code::UNSUPPORTED, READ_ERROR_REASON)),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Termination::Graceful { .. } => "graceful",
            Termination::IdleTimeout => "idle_timeout",
            Termination::Cancelled => "cancelled",
            Termination::PeerAbnormal { .. } => "peer_abnormal",
            Termination::ReadError(_) => "read_error",
        }
    }

    fn from_close_frame(frame: Option<CloseFrame<'static>>) -> Self {
        match frame {
            Some(frame) if frame.code == close_code::NORMAL || frame.code == close_code::AWAY => {
                Termination::Graceful { code: frame.code }
            }
            Some(frame) => Termination::PeerAbnormal { code: frame.code },
            None => Termination::PeerAbnormal {
                code: close_code::STATUS,
            },
        }
    }
}

/// Keeps a connection registered for exactly as long as its lifecycle lives.
///
/// `release` is the normal path. If the lifecycle future is dropped or unwinds
/// first, `Drop` schedules the unregister on the current runtime instead.
struct Registration {
    registry: Registry,
    id: ConnectionId,
    armed: bool,
}

impl Registration {
    async fn release(mut self) -> bool {
        self.armed = false;
        self.registry.unregister(self.id).await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.unregister(id).await;
                });
            }
            Err(_) => {
                error!(connection_id = %id, "no runtime available to unregister connection");
            }
        }
    }
}

pub struct Lifecycle {
    handle: Arc<ConnectionHandle>,
    registration: Registration,
    registry: Registry,
    config: LifecycleConfig,
    shutdown: CancellationToken,
}

impl Lifecycle {
    /// Registers the handle; the connection is `Open` from here on.
    pub async fn open(
        handle: Arc<ConnectionHandle>,
        registry: Registry,
        config: LifecycleConfig,
        shutdown: CancellationToken,
    ) -> Self {
        registry.register(handle.clone()).await;
        counter!("beach_relay_connections_total", 1);
        let registration = Registration {
            registry: registry.clone(),
            id: handle.id(),
            armed: true,
        };
        Self {
            handle,
            registration,
            registry,
            config,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Drives the read loop to completion and cleans up.
    pub async fn run<S>(self, mut inbound: S) -> Termination
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let id = self.handle.id();
        let remote_addr = self.handle.remote_addr();
        debug!(connection_id = %id, ?remote_addr, "read loop started");

        let mut peer_closing = false;
        let termination = loop {
            // Cancellation sits above the per-read deadline so shutdown never
            // waits out an idle timer.
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Termination::Cancelled,
                read = timeout(self.config.idle_timeout, inbound.next()) => read,
            };

            let frame = match next {
                Err(_) => break Termination::IdleTimeout,
                Ok(None) => {
                    break Termination::PeerAbnormal {
                        code: close_code::ABNORMAL,
                    }
                }
                Ok(Some(Err(err))) => break Termination::ReadError(ReadError::Transport(err)),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => match Envelope::decode(&text) {
                    Ok(mut envelope) => {
                        envelope.stamp(id);
                        counter!("beach_relay_messages_received_total", 1);
                        info!(
                            connection_id = %id,
                            envelope_type = %envelope.kind,
                            payload_bytes = envelope.payload_len(),
                            "received envelope"
                        );
                        self.registry.broadcast(&envelope, id).await;
                    }
                    Err(err) => break Termination::ReadError(err.into()),
                },
                Message::Binary(bytes) => {
                    break Termination::ReadError(DecodeError::Binary { len: bytes.len() }.into())
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    peer_closing = true;
                    break Termination::from_close_frame(frame);
                }
            }
        };

        if peer_closing {
            self.handle.mark_closed().await;
            self.complete_peer_close(&mut inbound).await;
        }
        self.drain(&termination).await;
        self.finish(&termination).await;
        termination
    }

    /// The transport queues its reply to a peer's close frame and writes it on
    /// the next read. Keep reading until the stream ends so the peer sees a
    /// completed handshake instead of a reset.
    async fn complete_peer_close<S>(&self, inbound: &mut S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let finished = timeout(self.config.close_timeout, async {
            while let Some(Ok(_)) = inbound.next().await {}
        })
        .await;
        if finished.is_err() {
            debug!(
                connection_id = %self.handle.id(),
                "peer close handshake did not finish in time"
            );
        }
    }

    /// Issues the close the termination calls for.
    async fn drain(&self, termination: &Termination) {
        let id = self.handle.id();
        match termination {
            Termination::Graceful { code } => {
                info!(connection_id = %id, code, "client disconnected normally");
                self.handle.mark_closed().await;
            }
            Termination::PeerAbnormal { code } => {
                warn!(connection_id = %id, code, "client disconnected abnormally");
                self.handle.mark_closed().await;
            }
            Termination::IdleTimeout => {
                info!(
                    connection_id = %id,
                    idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
                    "client read timeout"
                );
            }
            Termination::Cancelled => {
                info!(connection_id = %id, "read loop cancelled by shutdown");
            }
            Termination::ReadError(err) => {
                error!(connection_id = %id, error = %err, "failed to read envelope");
            }
        }

        if let Some((code, reason)) = termination.close_frame() {
            match self
                .handle
                .close(code, reason, self.config.close_timeout)
                .await
            {
                Ok(_) => info!(connection_id = %id, code, reason, "connection closed"),
                Err(err) => warn!(
                    connection_id = %id,
                    code,
                    error = %err,
                    "failed to close connection"
                ),
            }
        }
    }

    /// Runs once per connection: unregister, then the safety-net close.
    async fn finish(self, termination: &Termination) {
        let id = self.handle.id();
        self.registration.release().await;

        match self
            .handle
            .close(close_code::ERROR, SAFETY_NET_REASON, self.config.close_timeout)
            .await
        {
            Ok(true) => debug!(connection_id = %id, "safety-net close issued"),
            Ok(false) => {}
            Err(err) => debug!(connection_id = %id, error = %err, "safety-net close failed"),
        }

        counter!(
            "beach_relay_connections_closed_total",
            1,
            "reason" => termination.metric_label()
        );
        info!(
            connection_id = %id,
            reason = termination.metric_label(),
            "read loop finished"
        );
    }
}

/// Serves one upgraded socket from registration to close.
pub async fn serve_socket(
    socket: WebSocket,
    remote_addr: SocketAddr,
    registry: Registry,
    config: LifecycleConfig,
    shutdown: CancellationToken,
) -> Termination {
    let (outbound, inbound) = socket.split();
    let handle = Arc::new(ConnectionHandle::new(outbound, Some(remote_addr)));
    info!(
        connection_id = %handle.id(),
        %remote_addr,
        "websocket connection established"
    );
    Lifecycle::open(handle, registry, config, shutdown)
        .await
        .run(inbound)
        .await
}
