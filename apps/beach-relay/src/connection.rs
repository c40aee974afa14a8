use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::{sync::Mutex, time::timeout};
use uuid::Uuid;

/// Identity assigned to a connection when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of a transport. Implementations report failures as `Err`
/// and must not panic: a broadcast writes from the sender's task, so a panic
/// here would end the sender's connection instead of the recipient's.
pub type OutboundSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("connection already closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

impl DeliveryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::TimedOut(_) => "timeout",
            DeliveryError::Closed => "closed",
            DeliveryError::Transport(_) => "transport",
        }
    }
}

/// Server-side record for one accepted connection.
///
/// The handle owns the outbound half of the transport. Broadcasts from other
/// connections and the owning lifecycle both write through the same send lock,
/// so frames and the close handshake are never interleaved.
pub struct ConnectionHandle {
    id: ConnectionId,
    room: Option<String>,
    remote_addr: Option<SocketAddr>,
    outbound: Mutex<Outbound>,
    consecutive_failures: AtomicU32,
}

struct Outbound {
    sink: OutboundSink,
    closed: bool,
}

impl ConnectionHandle {
    pub fn new<S>(sink: S, remote_addr: Option<SocketAddr>) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            id: ConnectionId::new(),
            room: None,
            remote_addr,
            outbound: Mutex::new(Outbound {
                sink: Box::pin(sink),
                closed: false,
            }),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Not used for routing yet; every envelope goes to every peer.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Writes one frame. The deadline covers waiting for the send lock too.
    pub async fn send(&self, message: Message, deadline: Duration) -> Result<(), DeliveryError> {
        timeout(deadline, async {
            let mut outbound = self.outbound.lock().await;
            if outbound.closed {
                return Err(DeliveryError::Closed);
            }
            outbound.sink.send(message).await?;
            Ok::<(), DeliveryError>(())
        })
        .await
        .map_err(|_| DeliveryError::TimedOut(deadline))?
    }

    /// Sends a close frame unless the connection is already closed.
    ///
    /// Returns `Ok(false)` when there was nothing left to close. The handle is
    /// marked closed before the frame is written, so a failed attempt is never
    /// retried by later callers.
    pub async fn close(
        &self,
        code: u16,
        reason: &'static str,
        deadline: Duration,
    ) -> Result<bool, DeliveryError> {
        timeout(deadline, async {
            let mut outbound = self.outbound.lock().await;
            if outbound.closed {
                return Ok(false);
            }
            outbound.closed = true;
            outbound
                .sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Borrowed(reason),
                })))
                .await?;
            Ok::<bool, DeliveryError>(true)
        })
        .await
        .map_err(|_| DeliveryError::TimedOut(deadline))?
    }

    /// Records that the peer finished the close handshake on its own.
    pub async fn mark_closed(&self) {
        self.outbound.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.outbound.lock().await.closed
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use axum::extract::ws::close_code;
    use test_timeout::tokio_timeout_test;

    const DEADLINE: Duration = Duration::from_millis(200);

    #[tokio_timeout_test(5)]
    async fn identities_are_unique() {
        let (a, _rx_a) = channel_handle();
        let (b, _rx_b) = channel_handle();
        assert_ne!(a.id(), b.id());
        assert!(a.room().is_none());
    }

    #[tokio_timeout_test(5)]
    async fn second_close_is_a_no_op() {
        let (handle, mut rx) = channel_handle();
        let first = handle
            .close(close_code::POLICY, "Idle timeout", DEADLINE)
            .await
            .expect("first close");
        assert!(first);

        let second = handle
            .close(close_code::ERROR, "Internal server error occurred", DEADLINE)
            .await
            .expect("second close does not fail");
        assert!(!second);

        assert_eq!(
            drain_close_codes(&mut rx),
            vec![(close_code::POLICY, "Idle timeout".to_string())]
        );
    }

    #[tokio_timeout_test(5)]
    async fn send_after_close_is_rejected() {
        let (handle, _rx) = channel_handle();
        handle.mark_closed().await;
        assert!(handle.is_closed().await);
        let err = handle
            .send(Message::Text("{}".into()), DEADLINE)
            .await
            .expect_err("closed handle refuses writes");
        assert!(matches!(err, DeliveryError::Closed));
    }

    #[tokio_timeout_test(5)]
    async fn failed_close_still_marks_the_handle_closed() {
        let handle = broken_handle();
        let err = handle
            .close(close_code::UNSUPPORTED, "Read error", DEADLINE)
            .await
            .expect_err("transport is gone");
        assert!(matches!(err, DeliveryError::Transport(_)));
        assert!(handle.is_closed().await);
        assert!(!handle
            .close(close_code::ERROR, "Internal server error occurred", DEADLINE)
            .await
            .expect("safety net close is harmless"));
    }

    #[tokio_timeout_test(5)]
    async fn broken_transport_fails_every_write() {
        let handle = broken_handle();
        for _ in 0..3 {
            let err = handle
                .send(Message::Text("{}".into()), DEADLINE)
                .await
                .expect_err("transport is gone");
            assert!(matches!(err, DeliveryError::Transport(_)));
        }
        assert!(!handle.is_closed().await);
    }

    #[tokio_timeout_test(5)]
    async fn stalled_write_hits_deadline() {
        let handle = stalled_handle();
        let err = handle
            .send(Message::Text("{}".into()), DEADLINE)
            .await
            .expect_err("write never completes");
        assert!(matches!(err, DeliveryError::TimedOut(_)));
        assert_eq!(err.metric_label(), "timeout");
    }
}
