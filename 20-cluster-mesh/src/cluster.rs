//! Wiring a node together.
//!
//! [`ClusterService::start`] binds the listener, spawns the acceptor, the
//! broadcaster and the election loop, then dials whatever peers it was
//! given or discovered. The returned [`ClusterHandle`] is what the rest of
//! an application holds on to.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{info, warn};

use crate::{
    broadcast::Broadcaster,
    config::ClusterConfig,
    discovery,
    election::Election,
    engine::{ElectionStatus, Engine, EngineHandle},
    mesh::{Mesh, MeshSettings, SharedPriority},
    message::{NodeIdentity, PeerInfo},
    store::ReplicatedStore,
};

/// How long `shutdown` waits for the acceptor to drain.
const ACCEPTOR_DRAIN: Duration = Duration::from_secs(5);

pub struct ClusterService;

impl ClusterService {
    pub async fn start(config: ClusterConfig) -> Result<ClusterHandle> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let bound = listener.local_addr().context("listener has no address")?;

        let mut rng = StdRng::from_entropy();
        let range = config.election.priority_range.max(2);
        let priority = config.priority.unwrap_or_else(|| rng.gen_range(0..range));
        let identity = NodeIdentity {
            id: config.node_id.clone(),
            address: config.advertise.clone().unwrap_or_else(|| bound.to_string()),
            priority,
        };

        let shared_priority = SharedPriority::new(priority);
        let (mesh, events) = Mesh::new(
            MeshSettings {
                node_id: identity.id.clone(),
                auth_token: config.auth_token.clone(),
                outbound_capacity: config.outbound_capacity,
                inbound_capacity: config.inbound_capacity,
                dial_timeout: config.dial_timeout,
            },
            shared_priority.clone(),
        );
        let (store, changes) = ReplicatedStore::new(config.store_capacity.max(1));
        let store = Arc::new(store);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let election = Election::with_rng(
            priority,
            range,
            config.election.idle_timeout,
            Instant::now(),
            rng,
        );
        let (engine, engine_handle) = Engine::new(
            identity.id.clone(),
            election,
            config.election.tick_interval,
            shared_priority.clone(),
            Arc::clone(&store),
            broadcast_tx,
        );

        let acceptor = mesh.listen(listener);
        let broadcaster = tokio::spawn(
            Broadcaster::new(mesh.clone(), broadcast_rx, shutdown.subscribe()).run(),
        );
        let dispatch = tokio::spawn(engine.run(events, changes, shutdown.subscribe()));
        info!(id = %identity.id, address = %identity.address, priority, "node started");

        let handle = ClusterHandle {
            identity,
            priority: shared_priority,
            store,
            mesh,
            engine: engine_handle,
            shutdown,
            acceptor,
            tasks: vec![broadcaster, dispatch],
        };

        for peer in initial_peers(&config, &handle.identity).await {
            if let Err(err) = handle.mesh.dial(&peer).await {
                warn!(peer = %peer, error = %err, "failed to connect to peer");
            }
        }

        Ok(handle)
    }
}

/// Static peers plus whatever discovery knows, without duplicates or
/// ourselves. A failed discovery leaves just the static list.
async fn initial_peers(config: &ClusterConfig, me: &NodeIdentity) -> Vec<PeerInfo> {
    let mut peers: Vec<PeerInfo> = config.peers.clone();

    if let Some(url) = &config.discovery_url {
        let client = reqwest::Client::new();
        match discovery::join(&client, url, me).await {
            Ok(found) => {
                info!(count = found.len(), "discovery answered");
                peers.extend(found);
            }
            Err(err) => warn!(error = ?err, "discovery failed, continuing with static peers"),
        }
    }

    let mut seen = std::collections::HashSet::new();
    peers.retain(|peer| peer.id != me.id && seen.insert(peer.id.clone()));
    peers
}

/// A running node.
pub struct ClusterHandle {
    identity: NodeIdentity,
    priority: SharedPriority,
    store: Arc<ReplicatedStore>,
    mesh: Mesh,
    engine: EngineHandle,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<std::io::Result<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterHandle {
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// The `host:port` peers dial to reach this node.
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn peer_info(&self) -> PeerInfo {
        self.identity.peer_info()
    }

    /// Current priority; changes only after a collision.
    pub fn priority(&self) -> u32 {
        self.priority.get()
    }

    pub fn store(&self) -> Arc<ReplicatedStore> {
        Arc::clone(&self.store)
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// See [`EngineHandle::leadership`].
    pub fn leadership(&self) -> watch::Receiver<Option<bool>> {
        self.engine.leadership()
    }

    pub async fn status(&self) -> Result<ElectionStatus> {
        self.engine.status().await
    }

    /// Stops the election loop and broadcaster, closes every connection and
    /// waits for the spawned tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!(id = %self.identity.id, "node shutting down");
        self.shutdown.send_replace(true);
        self.mesh.shutdown().await;

        for task in self.tasks {
            task.await.context("cluster task panicked")?;
        }
        match time::timeout(ACCEPTOR_DRAIN, self.acceptor).await {
            Ok(joined) => joined
                .context("acceptor panicked")?
                .context("acceptor failed")?,
            Err(_) => warn!("acceptor did not drain in time"),
        }
        Ok(())
    }
}
