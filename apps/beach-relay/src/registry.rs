use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::extract::ws::{close_code, Message};
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    envelope::Envelope,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Deadline for a single write to one recipient.
    pub write_timeout: Duration,
    /// Consecutive delivery failures after which a recipient is dropped and
    /// closed. Zero keeps failing recipients registered until their own read
    /// loop ends.
    pub reap_after_failures: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reap_after_failures: 0,
        }
    }
}

/// Live connections plus fan-out over them.
///
/// A single lock guards the table. Broadcasts hold it for the whole fan-out so
/// every delivery sees the same set of peers; a slow recipient therefore delays
/// the rest by at most one write deadline.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    config: RegistryConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub reaped: usize,
    pub bytes: usize,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id();
        let mut connections = self.inner.connections.lock().await;
        connections.insert(id, handle);
        gauge!("beach_relay_connections_active", connections.len() as f64);
        info!(
            connection_id = %id,
            active_connections = connections.len(),
            "connection registered"
        );
    }

    /// Removes the connection if it is still present. Returns whether it was.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.inner.connections.lock().await;
        let removed = connections.remove(&id).is_some();
        if removed {
            gauge!("beach_relay_connections_active", connections.len() as f64);
            info!(
                connection_id = %id,
                active_connections = connections.len(),
                "connection unregistered"
            );
        } else {
            debug!(connection_id = %id, "connection already unregistered");
        }
        removed
    }

    /// Delivers `envelope` to every registered connection except `sender`.
    ///
    /// Failures are isolated to the recipient they happened on; the remaining
    /// peers still get the message.
    pub async fn broadcast(&self, envelope: &Envelope, sender: ConnectionId) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    sender = %sender,
                    envelope_type = %envelope.kind,
                    error = %err,
                    "failed to encode envelope"
                );
                return report;
            }
        };

        let config = &self.inner.config;
        let mut connections = self.inner.connections.lock().await;
        info!(
            sender = %sender,
            envelope_type = %envelope.kind,
            recipients = connections.len().saturating_sub(1),
            "broadcasting envelope"
        );

        let mut exhausted = Vec::new();
        for (id, handle) in connections.iter() {
            if *id == sender {
                continue;
            }
            match handle
                .send(Message::Text(text.clone()), config.write_timeout)
                .await
            {
                Ok(()) => {
                    handle.reset_failures();
                    report.delivered += 1;
                    report.bytes += text.len();
                }
                Err(err) => {
                    report.failed += 1;
                    let failures = handle.record_failure();
                    counter!(
                        "beach_relay_delivery_failures_total",
                        1,
                        "reason" => err.metric_label()
                    );
                    warn!(
                        sender = %sender,
                        connection_id = %id,
                        consecutive_failures = failures,
                        error = %err,
                        "failed to deliver envelope"
                    );
                    if config.reap_after_failures > 0 && failures >= config.reap_after_failures {
                        exhausted.push(*id);
                    }
                }
            }
        }

        for id in exhausted {
            let Some(handle) = connections.remove(&id) else {
                continue;
            };
            report.reaped += 1;
            counter!("beach_relay_connections_reaped_total", 1);
            warn!(
                connection_id = %id,
                consecutive_failures = handle.consecutive_failures(),
                "reaping connection after repeated delivery failures"
            );
            if let Err(err) = handle
                .close(close_code::ERROR, "Delivery failed", config.write_timeout)
                .await
            {
                debug!(connection_id = %id, error = %err, "close of reaped connection failed");
            }
        }
        if report.reaped > 0 {
            gauge!("beach_relay_connections_active", connections.len() as f64);
        }

        if report.delivered > 0 {
            counter!(
                "beach_relay_messages_delivered_total",
                report.delivered as u64
            );
        }
        report
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> =
            self.inner.connections.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{broken_handle, channel_handle, stalled_handle};
    use futures::channel::mpsc::UnboundedReceiver;
    use test_timeout::tokio_timeout_test;

    fn registry() -> Registry {
        Registry::new(RegistryConfig {
            write_timeout: Duration::from_millis(100),
            reap_after_failures: 0,
        })
    }

    fn envelope(kind: &str) -> Envelope {
        Envelope::decode(&format!(r#"{{"type":"{kind}","payload":{{"sdp":"v=0"}}}}"#))
            .expect("decode")
    }

    fn texts(rx: &mut UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Some(message)) = rx.try_next() {
            if let Message::Text(text) = message {
                out.push(serde_json::from_str(&text).expect("relayed json"));
            }
        }
        out
    }

    #[tokio_timeout_test(10)]
    async fn unregister_is_idempotent() {
        let registry = registry();
        let (handle, _rx) = channel_handle();
        registry.register(handle.clone()).await;
        assert!(registry.contains(handle.id()).await);

        assert!(registry.unregister(handle.id()).await);
        assert!(!registry.unregister(handle.id()).await);
        assert!(registry.is_empty().await);
    }

    #[tokio_timeout_test(10)]
    async fn registering_twice_keeps_one_entry() {
        let registry = registry();
        let (handle, _rx) = channel_handle();
        registry.register(handle.clone()).await;
        registry.register(handle.clone()).await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio_timeout_test(10)]
    async fn broadcast_skips_the_sender() {
        let registry = registry();
        let (a, mut rx_a) = channel_handle();
        let (b, mut rx_b) = channel_handle();
        let (c, mut rx_c) = channel_handle();
        for handle in [&a, &b, &c] {
            registry.register(handle.clone()).await;
        }

        let mut message = envelope("offer");
        message.stamp(a.id());
        let report = registry.broadcast(&message, a.id()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
        assert!(texts(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            let received = texts(rx);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0]["sender"], a.id().to_string());
            assert_eq!(received[0]["type"], "offer");
        }
    }

    #[tokio_timeout_test(10)]
    async fn failed_recipient_does_not_block_the_rest() {
        let registry = registry();
        let (a, _rx_a) = channel_handle();
        let b = broken_handle();
        let stalled = stalled_handle();
        let (c, mut rx_c) = channel_handle();
        for handle in [&a, &b, &stalled, &c] {
            registry.register(handle.clone()).await;
        }

        let report = registry.broadcast(&envelope("candidate"), a.id()).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.reaped, 0);
        assert_eq!(texts(&mut rx_c).len(), 1);
        assert!(registry.contains(b.id()).await);
        assert!(registry.contains(stalled.id()).await);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[tokio_timeout_test(10)]
    async fn successful_delivery_resets_failure_count() {
        let registry = registry();
        let (a, _rx_a) = channel_handle();
        let (b, _rx_b) = channel_handle();
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        b.record_failure();
        b.record_failure();
        registry.broadcast(&envelope("answer"), a.id()).await;
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio_timeout_test(10)]
    async fn reaping_removes_and_closes_dead_recipients() {
        let registry = Registry::new(RegistryConfig {
            write_timeout: Duration::from_millis(100),
            reap_after_failures: 2,
        });
        let (a, _rx_a) = channel_handle();
        let b = broken_handle();
        let (c, mut rx_c) = channel_handle();
        for handle in [&a, &b, &c] {
            registry.register(handle.clone()).await;
        }

        let first = registry.broadcast(&envelope("offer"), a.id()).await;
        assert_eq!(first.reaped, 0);
        assert!(registry.contains(b.id()).await);

        let second = registry.broadcast(&envelope("offer"), a.id()).await;
        assert_eq!(second.reaped, 1);
        assert!(!registry.contains(b.id()).await);
        assert!(b.is_closed().await);
        assert_eq!(texts(&mut rx_c).len(), 2);

        // The reaped connection's own cleanup later finds nothing to remove.
        assert!(!registry.unregister(b.id()).await);
    }

    #[tokio_timeout_test(20, multi_thread)]
    async fn concurrent_register_and_unregister_never_lose_updates() {
        let registry = registry();
        let mut keep = Vec::new();
        let mut tasks = Vec::new();

        for i in 0..64 {
            let (handle, rx) = channel_handle();
            let registry = registry.clone();
            let transient = i % 2 == 0;
            if !transient {
                keep.push(handle.id());
            }
            tasks.push(tokio::spawn(async move {
                registry.register(handle.clone()).await;
                tokio::task::yield_now().await;
                if transient {
                    registry.unregister(handle.id()).await;
                    registry.unregister(handle.id()).await;
                }
                drop(rx);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        keep.sort();
        assert_eq!(registry.ids().await, keep);
    }
}
