//! Discovery: how a fresh node finds its first peers.
//!
//! The service keeps a registry of nodes that joined and answers each join
//! with everyone it knew before. A background probe drops nodes whose
//! health endpoint stops answering. Nodes talk to it exactly once, at
//! startup, through [`join`].

use std::{
    collections::BTreeMap,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::{
    net::TcpListener,
    time::{self, Instant, MissedTickBehavior},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::DiscoveryConfig,
    mesh::{AUTH_TOKEN_HEADER, NODE_ID_HEADER},
    message::{NodeIdentity, PeerInfo},
};

/// Announces `me` to the discovery endpoint at `url` and returns the peers
/// it already knew about, never including `me`.
pub async fn join(client: &reqwest::Client, url: &str, me: &NodeIdentity) -> Result<Vec<PeerInfo>> {
    let known: BTreeMap<String, String> = client
        .post(url)
        .json(me)
        .send()
        .await
        .with_context(|| format!("failed to reach discovery at {url}"))?
        .error_for_status()
        .context("discovery rejected join")?
        .json()
        .await
        .context("malformed discovery response")?;

    Ok(known
        .into_iter()
        .filter(|(id, _)| *id != me.id)
        .map(|(id, address)| PeerInfo::new(id, address))
        .collect())
}

/// Floor for the per-probe timeout, so short intervals do not turn slow
/// answers into evictions.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Member {
    address: String,
    joined_at: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    members: Mutex<BTreeMap<String, Member>>,
}

impl Registry {
    /// Records `node` and returns who was known before it, minus itself.
    fn join(&self, node: &NodeIdentity) -> BTreeMap<String, String> {
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        let known = members
            .iter()
            .filter(|(id, _)| **id != node.id)
            .map(|(id, member)| (id.clone(), member.address.clone()))
            .collect();
        members.insert(
            node.id.clone(),
            Member {
                address: node.address.clone(),
                joined_at: Instant::now(),
            },
        );
        known
    }

    /// Members whose grace period is over.
    fn due_for_probe(&self, grace: Duration) -> Vec<(String, Member)> {
        let now = Instant::now();
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, member)| now.duration_since(member.joined_at) >= grace)
            .map(|(id, member)| (id.clone(), member.clone()))
            .collect()
    }

    /// Forgets `id` unless it re-joined since `probed` was taken.
    fn forget(&self, id: &str, probed: &Member) -> bool {
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        let unchanged = members
            .get(id)
            .is_some_and(|current| current.joined_at == probed.joined_at);
        if unchanged {
            members.remove(id);
        }
        unchanged
    }

    fn len(&self) -> usize {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/join", post(accept_join))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn health() -> &'static str {
    "Good. Thanks for asking!"
}

async fn accept_join(
    State(registry): State<Arc<Registry>>,
    body: Result<Json<NodeIdentity>, JsonRejection>,
) -> Response {
    let node = match body {
        Ok(Json(node)) => node,
        Err(rejection) => {
            debug!(error = %rejection, "malformed join");
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };
    if node.id.is_empty() || node.address.is_empty() {
        return (StatusCode::BAD_REQUEST, "node_id and url are required").into_response();
    }

    let known = registry.join(&node);
    info!(node = %node.id, address = %node.address, known = known.len(), "node joined");
    Json(known).into_response()
}

/// The discovery HTTP service plus its health probe.
pub struct DiscoveryService {
    listener: TcpListener,
    config: DiscoveryConfig,
    registry: Arc<Registry>,
}

impl DiscoveryService {
    pub fn new(listener: TcpListener, config: DiscoveryConfig) -> Self {
        Self {
            listener,
            config,
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let DiscoveryService {
            listener,
            config,
            registry,
        } = self;

        let client = reqwest::Client::builder()
            .timeout(config.health_interval.max(MIN_PROBE_TIMEOUT))
            .build()
            .context("failed to build health probe client")?;
        let prober = tokio::spawn(probe_loop(Arc::clone(&registry), client, config));

        let served = axum::serve(listener, router(registry))
            .with_graceful_shutdown(shutdown)
            .await;
        prober.abort();
        served.context("discovery server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn probe_loop(registry: Arc<Registry>, client: reqwest::Client, config: DiscoveryConfig) {
    let mut ticker = time::interval(config.health_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for (id, member) in registry.due_for_probe(config.join_grace) {
            if probe(&client, &config.auth_token, &id, &member.address).await {
                continue;
            }
            if registry.forget(&id, &member) {
                info!(node = %id, address = %member.address, remaining = registry.len(), "forgetting unhealthy node");
            }
        }
    }
}

async fn probe(client: &reqwest::Client, auth_token: &str, id: &str, address: &str) -> bool {
    let response = client
        .get(format!("http://{address}/health"))
        .header(AUTH_TOKEN_HEADER, auth_token)
        .header(NODE_ID_HEADER, id)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            debug!(node = %id, status = %response.status(), "health probe refused");
            false
        }
        Err(err) => {
            debug!(node = %id, error = %err, "health probe failed");
            false
        }
    }
}
