use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{ClusterConfig, DEFAULT_AUTH_TOKEN, DiscoveryConfig, ElectionConfig},
    message::PeerInfo,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cluster node that joins the mesh and takes part in elections.
    Node(NodeArgs),
    /// Run the discovery service nodes ask for their initial peer list.
    Discovery(DiscoveryArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Socket address peers connect to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Address announced to discovery, if different from the bound one.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Shared secret every node of the cluster presents on connect.
    #[arg(long, default_value = DEFAULT_AUTH_TOKEN)]
    pub auth_token: String,

    /// Discovery join endpoint, e.g. http://127.0.0.1:4000/join
    #[arg(long)]
    pub discovery_url: Option<String>,

    /// Static peers to dial: id=host:port (repeatable or comma separated)
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<PeerInfo>,

    /// Fixed starting priority instead of a random one.
    #[arg(long)]
    pub priority: Option<u32>,

    /// Election timer period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,

    /// Quiet period in milliseconds before an undecided node decides.
    #[arg(long, default_value_t = 5000)]
    pub idle_timeout_ms: u64,

    /// Give up on a peer that has not answered a dial within this many milliseconds.
    #[arg(long, default_value_t = 45_000)]
    pub dial_timeout_ms: u64,
}

impl NodeArgs {
    pub fn into_config(self) -> ClusterConfig {
        ClusterConfig {
            listen: self.listen,
            advertise: self.advertise,
            auth_token: self.auth_token,
            discovery_url: self.discovery_url,
            peers: self.peer,
            priority: self.priority,
            election: ElectionConfig {
                tick_interval: Duration::from_millis(self.tick_ms),
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
                ..ElectionConfig::default()
            },
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            ..ClusterConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    /// Socket address the discovery service binds to.
    #[arg(long, default_value = "127.0.0.1:4000")]
    pub listen: SocketAddr,

    /// Secret used when probing node health endpoints.
    #[arg(long, default_value = DEFAULT_AUTH_TOKEN)]
    pub auth_token: String,

    /// How often joined nodes are probed, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub health_interval_ms: u64,

    /// How long after joining a node is left unprobed, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub grace_ms: u64,
}

impl DiscoveryArgs {
    pub fn into_config(self) -> DiscoveryConfig {
        DiscoveryConfig {
            listen: self.listen,
            auth_token: self.auth_token,
            health_interval: Duration::from_millis(self.health_interval_ms),
            join_grace: Duration::from_millis(self.grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_flags_map_onto_config() {
        let cli = Cli::parse_from([
            "cluster_mesh",
            "node",
            "--listen",
            "127.0.0.1:0",
            "--peer",
            "a=127.0.0.1:5001,b=127.0.0.1:5002",
            "--priority",
            "80",
            "--idle-timeout-ms",
            "300",
            "--dial-timeout-ms",
            "750",
        ]);
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        let config = args.into_config();

        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1], PeerInfo::new("b", "127.0.0.1:5002"));
        assert_eq!(config.priority, Some(80));
        assert_eq!(config.election.idle_timeout, Duration::from_millis(300));
        assert_eq!(config.election.tick_interval, Duration::from_secs(1));
        assert_eq!(config.dial_timeout, Duration::from_millis(750));
        assert_eq!(config.auth_token, DEFAULT_AUTH_TOKEN);
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn rejects_malformed_peer() {
        let result = Cli::try_parse_from(["cluster_mesh", "node", "--peer", "127.0.0.1:5001"]);
        assert!(result.is_err());
    }
}
