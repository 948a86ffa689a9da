use std::{net::SocketAddr, time::Duration};

use crate::message::PeerInfo;

pub const DEFAULT_AUTH_TOKEN: &str = "secrettoken";

/// Timing and priority parameters of the election loop.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How often the dispatch loop re-evaluates an undecided election.
    pub tick_interval: Duration,
    /// Quiet period after the last bully before a node decides.
    pub idle_timeout: Duration,
    /// Priorities are drawn from `0..priority_range`.
    pub priority_range: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            priority_range: 100,
        }
    }
}

/// Everything needed to start one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    /// Address the acceptor binds. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// `host:port` peers should dial; defaults to the bound address.
    pub advertise: Option<String>,
    /// Shared cluster secret presented in every handshake.
    pub auth_token: String,
    /// Discovery `join` endpoint asked once at startup.
    pub discovery_url: Option<String>,
    /// Peers to dial in addition to whatever discovery returns.
    pub peers: Vec<PeerInfo>,
    /// Starting priority; random when unset.
    pub priority: Option<u32>,
    pub election: ElectionConfig,
    /// Per-peer outbound queue depth.
    pub outbound_capacity: usize,
    /// Depth of the inbound queue shared by all connections.
    pub inbound_capacity: usize,
    pub broadcast_capacity: usize,
    /// Depth of the leader's state change queue.
    pub store_capacity: usize,
    /// How long one dial may take, connect plus handshake.
    pub dial_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: nanoid::nanoid!(),
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            advertise: None,
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            discovery_url: None,
            peers: Vec::new(),
            priority: None,
            election: ElectionConfig::default(),
            outbound_capacity: 4,
            inbound_capacity: 16,
            broadcast_capacity: 8,
            store_capacity: 8,
            dial_timeout: Duration::from_secs(45),
        }
    }
}

/// Settings for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub listen: SocketAddr,
    /// Secret sent when probing a node's health endpoint.
    pub auth_token: String,
    pub health_interval: Duration,
    /// Newly joined nodes are not probed until this has passed.
    pub join_grace: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4000)),
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            health_interval: Duration::from_secs(2),
            join_grace: Duration::from_secs(2),
        }
    }
}
