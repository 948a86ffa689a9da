//! Self-organizing cluster layer.
//!
//! Nodes keep one WebSocket to every peer they know, agree on a single
//! leader with a bully-style election, and replicate a small key-value
//! mapping from the leader to everyone else.
//!
//! - [`mesh`] owns the connections: handshake, per-peer reader/writer
//!   tasks, the shared inbound queue and peer-down events.
//! - [`election`] is the pure election state machine; [`engine`] is the
//!   single task that owns it and reacts to timer ticks and mesh events.
//! - [`broadcast`] drains the "send to everyone" queue in order.
//! - [`store`] holds the replicated mapping.
//! - [`discovery`] is the join service nodes ask for their first peers.
//! - [`cluster`] wires all of the above into a running node.
//!
//! [`message`] defines the JSON wire format shared by all of them, and
//! [`cli`] / [`config`] describe how a node or discovery service is set up.

pub mod broadcast;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod election;
pub mod engine;
pub mod error;
pub mod mesh;
pub mod message;
pub mod store;

use tokio::sync::watch;

/// Resolves once `shutdown` reads true, or once its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
