//! Transport layer: one persistent WebSocket per peer.
//!
//! The mesh keeps a table of live connections keyed by peer id. Each entry
//! owns a small outbound queue and an interrupt; the connection's own task
//! drains the queue and is the only place that tears the entry down again.
//! All connections feed one shared inbound queue, and every teardown emits
//! exactly one peer-down event.
//!
//! Inbound connections arrive through the axum router built in
//! [`handshake`]; outbound ones are opened with [`Mesh::dial`]. Both paths
//! authenticate with the shared cluster secret and the sender's node id,
//! and both end up in [`connection::run`].

mod connection;
mod handshake;

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex, Notify},
    task::JoinHandle,
    time::{self, Duration},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue},
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Fanout,
    error::MeshError,
    message::{Message, PeerInfo},
};

use connection::{Connection, Frame, FrameSink, FrameStream};

pub use handshake::{AUTH_TOKEN_HEADER, NODE_ID_HEADER};

/// A message read off some connection, attributed to the peer id that
/// connection was registered under.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub peer_id: String,
    pub message: Message,
}

/// The local priority as the mesh announces it on every new connection.
///
/// Only the election dispatch loop stores into it.
#[derive(Debug, Clone, Default)]
pub struct SharedPriority(Arc<AtomicU32>);

impl SharedPriority {
    pub fn new(priority: u32) -> Self {
        Self(Arc::new(AtomicU32::new(priority)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, priority: u32) {
        self.0.store(priority, Ordering::Release);
    }
}

/// Settings the mesh needs about the local node.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub node_id: String,
    pub auth_token: String,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    /// Upper bound on connecting plus the WebSocket handshake in [`Mesh::dial`].
    pub dial_timeout: Duration,
}

/// Receiving side of the mesh, owned by the dispatch loop.
pub struct MeshEvents {
    pub inbound: mpsc::Receiver<Inbound>,
    pub peer_down: mpsc::Receiver<String>,
}

impl MeshEvents {
    /// Next message from any peer. `None` once the mesh has shut down and
    /// every connection has drained.
    pub async fn receive(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub async fn next_peer_down(&mut self) -> Option<String> {
        self.peer_down.recv().await
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Dialed,
    Accepted,
}

struct ConnectionEntry {
    serial: u64,
    direction: Direction,
    outbound: mpsc::Sender<Message>,
    interrupt: Arc<Notify>,
}

#[derive(Default)]
struct ConnectionTable {
    peers: HashMap<String, ConnectionEntry>,
    /// Cloned into each reader; taken on shutdown so the queue closes once
    /// the last reader is gone.
    inbound: Option<mpsc::Sender<Inbound>>,
    shutting_down: bool,
}

/// What a successfully registered connection gets to own.
struct Registration {
    serial: u64,
    outbound: mpsc::Receiver<Message>,
    interrupt: Arc<Notify>,
    inbound: mpsc::Sender<Inbound>,
}

struct MeshShared {
    settings: MeshSettings,
    priority: SharedPriority,
    table: Mutex<ConnectionTable>,
    peer_down: mpsc::Sender<String>,
    next_serial: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl MeshShared {
    /// When two nodes dial each other at once, both keep the connection
    /// opened by the smaller node id.
    fn preferred_direction(&self, peer_id: &str) -> Direction {
        if self.settings.node_id.as_str() < peer_id {
            Direction::Dialed
        } else {
            Direction::Accepted
        }
    }

    /// A new connection may take the slot when it is free, or when it
    /// crosses the existing one and is the preferred of the two.
    fn admits(&self, existing: Option<&ConnectionEntry>, peer_id: &str, direction: Direction) -> bool {
        match existing {
            None => true,
            Some(entry) => {
                entry.direction != direction && direction == self.preferred_direction(peer_id)
            }
        }
    }

    async fn would_admit(&self, peer_id: &str, direction: Direction) -> bool {
        let table = self.table.lock().await;
        self.admits(table.peers.get(peer_id), peer_id, direction)
    }

    /// Atomically claims `peer_id` and queues the mandatory announce. A
    /// crossed connection that loses the tie-break is interrupted and
    /// replaced.
    async fn register(&self, peer_id: &str, direction: Direction) -> Result<Registration, MeshError> {
        let mut table = self.table.lock().await;
        if table.shutting_down {
            return Err(MeshError::ShuttingDown);
        }
        let existing = table.peers.get(peer_id);
        if !self.admits(existing, peer_id, direction) {
            return Err(MeshError::DuplicateConnection {
                peer_id: peer_id.to_string(),
            });
        }
        if let Some(replaced) = existing {
            debug!(peer = %peer_id, ?direction, "crossed connection, replacing the other one");
            replaced.interrupt.notify_one();
        }
        let inbound = table.inbound.clone().ok_or(MeshError::ShuttingDown)?;

        let (outbound_tx, outbound) = mpsc::channel(self.settings.outbound_capacity.max(1));
        // Newcomers learn our priority straight away.
        let announce = Message::election(self.settings.node_id.clone(), self.priority.get());
        if outbound_tx.try_send(announce).is_err() {
            warn!(peer = %peer_id, "failed to queue announce");
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let interrupt = Arc::new(Notify::new());
        table.peers.insert(
            peer_id.to_string(),
            ConnectionEntry {
                serial,
                direction,
                outbound: outbound_tx,
                interrupt: Arc::clone(&interrupt),
            },
        );

        Ok(Registration {
            serial,
            outbound,
            interrupt,
            inbound,
        })
    }

    /// Removes the entry if it still belongs to connection `serial` and
    /// reports the peer as down. Called once, by the connection's own task.
    /// A connection that was replaced by a crossed one reports nothing; the
    /// peer is still connected.
    async fn teardown(&self, peer_id: &str, serial: u64) {
        let removed = {
            let mut table = self.table.lock().await;
            let current = table
                .peers
                .get(peer_id)
                .is_some_and(|entry| entry.serial == serial);
            if current {
                table.peers.remove(peer_id);
            }
            current
        };
        if !removed {
            debug!(peer = %peer_id, "replaced connection closed");
            return;
        }

        info!(peer = %peer_id, "connection closed");
        if self.peer_down.send(peer_id.to_string()).await.is_err() {
            debug!(peer = %peer_id, "peer down not delivered, dispatch loop is gone");
        }
    }

    async fn outbound_for(&self, peer_id: &str) -> Option<mpsc::Sender<Message>> {
        self.table
            .lock()
            .await
            .peers
            .get(peer_id)
            .map(|entry| entry.outbound.clone())
    }
}

/// Cheap, clonable handle to the mesh.
#[derive(Clone)]
pub struct Mesh {
    shared: Arc<MeshShared>,
}

impl Mesh {
    pub fn new(settings: MeshSettings, priority: SharedPriority) -> (Self, MeshEvents) {
        let (inbound_tx, inbound) = mpsc::channel(settings.inbound_capacity.max(1));
        let (peer_down_tx, peer_down) = mpsc::channel(settings.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let table = ConnectionTable {
            inbound: Some(inbound_tx),
            ..ConnectionTable::default()
        };
        let shared = MeshShared {
            settings,
            priority,
            table: Mutex::new(table),
            peer_down: peer_down_tx,
            next_serial: AtomicU64::new(1),
            shutdown,
        };

        let mesh = Self {
            shared: Arc::new(shared),
        };
        (mesh, MeshEvents { inbound, peer_down })
    }

    pub fn node_id(&self) -> &str {
        &self.shared.settings.node_id
    }

    /// Serves the handshake and health endpoints on `listener` until the
    /// mesh shuts down.
    pub fn listen(&self, listener: TcpListener) -> JoinHandle<std::io::Result<()>> {
        let router = handshake::router(Arc::clone(&self.shared));
        let mut shutdown = self.shared.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "mesh listening");
        }

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    crate::shutdown_requested(&mut shutdown).await;
                })
                .await
        })
    }

    /// Opens an outbound connection to `peer`. Failures are returned to the
    /// caller, nothing is retried here.
    pub async fn dial(&self, peer: &PeerInfo) -> Result<(), MeshError> {
        if peer.id == self.shared.settings.node_id {
            return Err(MeshError::Handshake("refusing to dial ourselves".into()));
        }
        if *self.shared.shutdown.borrow() {
            return Err(MeshError::ShuttingDown);
        }
        if !self.shared.would_admit(&peer.id, Direction::Dialed).await {
            return Err(MeshError::DuplicateConnection {
                peer_id: peer.id.clone(),
            });
        }

        let request = self.handshake_request(&peer.address)?;
        let limit = self.shared.settings.dial_timeout;
        info!(peer = %peer.id, address = %peer.address, "dialing peer");
        let (socket, _) = time::timeout(limit, connect_async(request))
            .await
            .map_err(|_| MeshError::dial(&peer.address, format!("no answer within {limit:?}")))?
            .map_err(|err| dial_error(&peer.address, &peer.id, err))?;

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(MeshError::transport)
            .with(|frame: Frame| futures_util::future::ready(Ok::<_, MeshError>(frame.into())));
        let stream = stream.map(|item| item.map(Frame::from).map_err(MeshError::transport));

        let mut sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);
        let registration = match self.shared.register(&peer.id, Direction::Dialed).await {
            Ok(registration) => registration,
            Err(err) => {
                let _ = sink.send(Frame::Close).await;
                return Err(err);
            }
        };

        info!(peer = %peer.id, "connected to peer");
        let connection = Connection::new(peer.id.clone(), sink, stream, registration);
        tokio::spawn(connection::run(Arc::clone(&self.shared), connection));
        Ok(())
    }

    fn handshake_request(
        &self,
        address: &str,
    ) -> Result<tungstenite::handshake::client::Request, MeshError> {
        let mut request = format!("ws://{address}/")
            .into_client_request()
            .map_err(|err| MeshError::dial(address, err))?;
        let headers = request.headers_mut();
        headers.insert(
            AUTH_TOKEN_HEADER,
            HeaderValue::from_str(&self.shared.settings.auth_token)
                .map_err(|err| MeshError::Handshake(err.to_string()))?,
        );
        headers.insert(
            NODE_ID_HEADER,
            HeaderValue::from_str(&self.shared.settings.node_id)
                .map_err(|err| MeshError::Handshake(err.to_string()))?,
        );
        Ok(request)
    }

    /// Queues `message` for one peer. Returns false when the peer has no
    /// live connection and the message was dropped.
    pub async fn send(&self, peer_id: &str, message: Message) -> bool {
        let Some(outbound) = self.shared.outbound_for(peer_id).await else {
            debug!(peer = %peer_id, "no connection, dropping message");
            return false;
        };
        outbound.send(message).await.is_ok()
    }

    /// Queues a copy of `message` on every live connection and returns how
    /// many accepted it.
    pub async fn broadcast_all(&self, message: Message) -> usize {
        let targets: Vec<(String, mpsc::Sender<Message>)> = {
            let table = self.shared.table.lock().await;
            table
                .peers
                .iter()
                .map(|(id, entry)| (id.clone(), entry.outbound.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (peer_id, outbound) in targets {
            if outbound.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(peer = %peer_id, "connection closed before broadcast");
            }
        }
        delivered
    }

    /// Closes the connection to `peer_id`, if any. Teardown and the
    /// peer-down event happen on the connection's own task.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let table = self.shared.table.lock().await;
        match table.peers.get(peer_id) {
            Some(entry) => {
                entry.interrupt.notify_one();
                true
            }
            None => false,
        }
    }

    /// Ids of the peers with a live connection.
    pub async fn peers(&self) -> Vec<String> {
        let table = self.shared.table.lock().await;
        let mut peers: Vec<String> = table.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Stops accepting, closes the shared inbound queue and interrupts every
    /// connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }

        let mut table = self.shared.table.lock().await;
        table.shutting_down = true;
        table.inbound = None;
        for (peer_id, entry) in &table.peers {
            debug!(peer = %peer_id, "interrupting connection");
            entry.interrupt.notify_one();
        }
        info!(connections = table.peers.len(), "mesh shutting down");
    }
}

impl Fanout for Mesh {
    fn broadcast_all(&self, message: Message) -> impl Future<Output = usize> + Send {
        Mesh::broadcast_all(self, message)
    }
}

fn dial_error(address: &str, peer_id: &str, err: tungstenite::Error) -> MeshError {
    match &err {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 => MeshError::Authentication,
            409 => MeshError::DuplicateConnection {
                peer_id: peer_id.to_string(),
            },
            _ => MeshError::dial(address, err),
        },
        _ => MeshError::dial(address, err),
    }
}
