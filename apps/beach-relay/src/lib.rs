//! Beach signaling relay.
//!
//! Peers connect over a websocket at `/ws` and exchange JSON [`Envelope`]s.
//! Every envelope is stamped with the identity of the connection it arrived on
//! and fanned out to every other connected peer. Payloads are opaque to the
//! relay.

pub mod app;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod lifecycle;
pub mod origin;
pub mod registry;
pub mod telemetry;

pub use app::{router, serve, AppState};
pub use connection::{ConnectionHandle, ConnectionId};
pub use envelope::Envelope;
pub use lifecycle::{Lifecycle, LifecycleConfig, Termination};
pub use registry::{BroadcastReport, Registry, RegistryConfig};
