//! Discovery service against real nodes.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::sleep};

use cluster_mesh::{
    cluster::{ClusterHandle, ClusterService},
    config::{ClusterConfig, DiscoveryConfig},
    discovery::{self, DiscoveryService},
    message::{NodeIdentity, PeerInfo},
};

const WAIT: Duration = Duration::from_secs(5);

struct RunningDiscovery {
    join_url: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl RunningDiscovery {
    async fn start(health_interval: Duration, join_grace: Duration) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let service = DiscoveryService::new(
            listener,
            DiscoveryConfig {
                health_interval,
                join_grace,
                ..DiscoveryConfig::default()
            },
        );
        let join_url = format!("http://{}/join", service.local_addr()?);
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(service.run_until(async move {
            let _ = stopped.await;
        }));
        Ok(Self {
            join_url,
            stop,
            task,
        })
    }

    async fn stop(self) -> Result<()> {
        let _ = self.stop.send(());
        self.task.await?
    }
}

fn identity(id: &str, address: &str) -> NodeIdentity {
    NodeIdentity {
        id: id.to_string(),
        address: address.to_string(),
        priority: 1,
    }
}

async fn start_node(id: &str, discovery_url: &str) -> Result<ClusterHandle> {
    ClusterService::start(ClusterConfig {
        node_id: id.to_string(),
        listen: "127.0.0.1:0".parse()?,
        discovery_url: Some(discovery_url.to_string()),
        ..ClusterConfig::default()
    })
    .await
}

#[tokio::test]
async fn join_lists_earlier_nodes_but_not_the_caller() -> Result<()> {
    let discovery = RunningDiscovery::start(Duration::from_secs(60), Duration::from_secs(60)).await?;
    let client = reqwest::Client::new();

    let first = discovery::join(&client, &discovery.join_url, &identity("a", "127.0.0.1:6001")).await?;
    assert!(first.is_empty());

    let second = discovery::join(&client, &discovery.join_url, &identity("b", "127.0.0.1:6002")).await?;
    assert_eq!(second, vec![PeerInfo::new("a", "127.0.0.1:6001")]);

    let again = discovery::join(&client, &discovery.join_url, &identity("a", "127.0.0.1:6001")).await?;
    assert_eq!(again, vec![PeerInfo::new("b", "127.0.0.1:6002")]);

    discovery.stop().await
}

#[tokio::test]
async fn join_fails_when_discovery_is_unreachable() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/join", listener.local_addr()?);
    drop(listener);

    let result = discovery::join(&reqwest::Client::new(), &url, &identity("a", "127.0.0.1:6001")).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn nodes_find_each_other_through_discovery() -> Result<()> {
    let discovery = RunningDiscovery::start(Duration::from_secs(60), Duration::from_secs(60)).await?;

    let a = start_node("a", &discovery.join_url).await?;
    let b = start_node("b", &discovery.join_url).await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while a.mesh().peers().await != vec!["b".to_string()] {
        if tokio::time::Instant::now() >= deadline {
            bail!("a never saw b");
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(b.mesh().peers().await, vec!["a".to_string()]);

    b.shutdown().await?;
    a.shutdown().await?;
    discovery.stop().await
}

#[tokio::test]
async fn unhealthy_nodes_are_forgotten() -> Result<()> {
    let discovery =
        RunningDiscovery::start(Duration::from_millis(50), Duration::from_millis(50)).await?;
    let client = reqwest::Client::new();

    // A live node answers its health probe; the dead address never will.
    let live = start_node("live", &discovery.join_url).await?;
    let dead_listener = TcpListener::bind("127.0.0.1:0").await?;
    let dead_address = dead_listener.local_addr()?.to_string();
    drop(dead_listener);
    discovery::join(&client, &discovery.join_url, &identity("dead", &dead_address)).await?;

    sleep(Duration::from_millis(500)).await;

    let known = discovery::join(&client, &discovery.join_url, &identity("late", "127.0.0.1:6003")).await?;
    assert_eq!(known, vec![live.peer_info()]);

    live.shutdown().await?;
    discovery.stop().await
}
