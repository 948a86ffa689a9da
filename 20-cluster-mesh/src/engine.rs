//! The dispatch loop that owns the election.
//!
//! Every event that can touch election state (timer ticks, inbound
//! messages, peer-down notices, local state changes and status queries)
//! is funnelled into one task and handled to completion before the next.
//! Nothing else holds the [`Election`], so its fields need no locking.
//!
//! Outward effects go through channels: announcements to the broadcaster
//! queue, leadership verdicts to a `watch` channel, and the current
//! priority to the [`SharedPriority`] read by the mesh.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    election::{Election, Observation, Role},
    mesh::{Inbound, MeshEvents, SharedPriority},
    message::{Message, Payload, StateSnapshot},
    store::ReplicatedStore,
};

/// Point-in-time view of the election as seen by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionStatus {
    pub node_id: String,
    pub priority: u32,
    pub role: Role,
    pub biggest_bully_seen: Option<u32>,
    pub self_nominations: u64,
}

enum EngineRequest {
    Status {
        respond_to: oneshot::Sender<ElectionStatus>,
    },
}

/// Handle for talking to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<EngineRequest>,
    leadership: watch::Receiver<Option<bool>>,
}

impl EngineHandle {
    /// Asks the dispatch loop for its current state.
    pub async fn status(&self) -> Result<ElectionStatus> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(EngineRequest::Status { respond_to })
            .await
            .context("failed to send status request")?;
        response.await.context("status response channel closed")
    }

    /// Leadership verdicts. `None` until the first decision, then the latest
    /// one: `true` for leader, `false` for follower.
    pub fn leadership(&self) -> watch::Receiver<Option<bool>> {
        self.leadership.clone()
    }
}

pub struct Engine {
    node_id: String,
    election: Election,
    tick_interval: Duration,
    priority: SharedPriority,
    store: Arc<ReplicatedStore>,
    broadcasts: mpsc::Sender<Message>,
    leadership: watch::Sender<Option<bool>>,
    requests: mpsc::Receiver<EngineRequest>,
}

impl Engine {
    /// `priority` must already hold `election.priority()`; from here on the
    /// engine is its only writer.
    pub fn new(
        node_id: impl Into<String>,
        election: Election,
        tick_interval: Duration,
        priority: SharedPriority,
        store: Arc<ReplicatedStore>,
        broadcasts: mpsc::Sender<Message>,
    ) -> (Self, EngineHandle) {
        let (requests_tx, requests) = mpsc::channel(8);
        let (leadership, leadership_rx) = watch::channel(None);

        let engine = Self {
            node_id: node_id.into(),
            election,
            tick_interval,
            priority,
            store,
            broadcasts,
            leadership,
            requests,
        };
        let handle = EngineHandle {
            requests: requests_tx,
            leadership: leadership_rx,
        };
        (engine, handle)
    }

    /// Runs until `shutdown` flips to true. A closed mesh or store queue
    /// only disables that source; the timer and status queries keep going.
    pub async fn run(
        mut self,
        events: MeshEvents,
        mut changes: mpsc::Receiver<StateSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let MeshEvents {
            mut inbound,
            mut peer_down,
        } = events;
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(priority = self.election.priority(), "election loop started");
        loop {
            tokio::select! {
                biased;
                _ = crate::shutdown_requested(&mut shutdown) => break,
                Some(peer_id) = peer_down.recv() => self.handle_peer_down(&peer_id).await,
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                Some(snapshot) = changes.recv() => self.handle_state_change(snapshot).await,
                Some(request) = self.requests.recv() => self.handle_request(request),
                _ = ticker.tick() => self.handle_tick(),
            }
        }
        debug!("election loop stopped");
    }

    fn handle_tick(&mut self) {
        let Some(is_leader) = self.election.on_tick(Instant::now()) else {
            return;
        };

        self.leadership.send_replace(Some(is_leader));
        if is_leader {
            info!(priority = self.election.priority(), "decided: leader");
        } else {
            info!(
                priority = self.election.priority(),
                biggest_bully_seen = ?self.election.biggest_bully_seen(),
                "decided: follower"
            );
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { peer_id, message } = inbound;
        match message.payload {
            Payload::Election(priority) => self.handle_election(&peer_id, priority).await,
            Payload::StateSync(snapshot) => {
                debug!(peer = %peer_id, entries = snapshot.entries.len(), "applying state snapshot");
                self.store.apply_snapshot(snapshot);
            }
            Payload::Heartbeat => trace!(peer = %peer_id, "heartbeat"),
        }
    }

    async fn handle_election(&mut self, peer_id: &str, priority: u32) {
        match self.election.on_election(priority, Instant::now()) {
            Observation::Collision { rerolled_to } => {
                info!(peer = %peer_id, old = priority, new = rerolled_to, "priority collision, rerolled");
                self.priority.set(rerolled_to);
            }
            Observation::Weaker { priority: ours } => {
                debug!(peer = %peer_id, theirs = priority, ours, "weaker peer, bullying");
                self.enqueue(Message::election(self.node_id.clone(), ours)).await;
            }
            Observation::Stronger => {
                debug!(peer = %peer_id, theirs = priority, "stronger peer, backing off");
            }
        }
    }

    async fn handle_peer_down(&mut self, peer_id: &str) {
        match self.election.on_peer_down(Instant::now()) {
            Some(priority) => {
                info!(peer = %peer_id, priority, "soldier down, nominating self");
                self.enqueue(Message::election(self.node_id.clone(), priority)).await;
            }
            None => debug!(peer = %peer_id, "soldier down, leader stays put"),
        }
    }

    async fn handle_state_change(&mut self, snapshot: StateSnapshot) {
        if !self.election.is_leader() {
            warn!(role = %self.election.role(), "state written by a node that is not leader");
        }
        self.enqueue(Message::state_sync(self.node_id.clone(), snapshot))
            .await;
    }

    fn handle_request(&self, request: EngineRequest) {
        match request {
            EngineRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn status(&self) -> ElectionStatus {
        ElectionStatus {
            node_id: self.node_id.clone(),
            priority: self.election.priority(),
            role: self.election.role(),
            biggest_bully_seen: self.election.biggest_bully_seen(),
            self_nominations: self.election.self_nominations(),
        }
    }

    async fn enqueue(&self, message: Message) {
        if self.broadcasts.send(message).await.is_err() {
            debug!("broadcaster is gone, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;
    use tokio::{task::JoinHandle, time::timeout};

    use super::*;

    const TICK: Duration = Duration::from_millis(10);
    const IDLE: Duration = Duration::from_millis(60);
    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        inbound: mpsc::Sender<Inbound>,
        peer_down: mpsc::Sender<String>,
        broadcasts: mpsc::Receiver<Message>,
        store: Arc<ReplicatedStore>,
        priority: SharedPriority,
        handle: EngineHandle,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn spawn(priority: u32) -> Self {
            let election =
                Election::with_rng(priority, 100, IDLE, Instant::now(), StdRng::seed_from_u64(3));
            let shared_priority = SharedPriority::new(priority);
            let (store, changes) = ReplicatedStore::new(4);
            let store = Arc::new(store);
            let (broadcast_tx, broadcasts) = mpsc::channel(16);
            let (engine, handle) = Engine::new(
                "me",
                election,
                TICK,
                shared_priority.clone(),
                Arc::clone(&store),
                broadcast_tx,
            );

            let (inbound, inbound_rx) = mpsc::channel(16);
            let (peer_down, peer_down_rx) = mpsc::channel(16);
            let events = MeshEvents {
                inbound: inbound_rx,
                peer_down: peer_down_rx,
            };
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(engine.run(events, changes, shutdown_rx));

            Self {
                inbound,
                peer_down,
                broadcasts,
                store,
                priority: shared_priority,
                handle,
                shutdown,
                task,
            }
        }

        async fn hear(&self, from: &str, message: Message) {
            let inbound = Inbound {
                peer_id: from.to_string(),
                message,
            };
            self.inbound.send(inbound).await.unwrap();
        }

        async fn decision(&self) -> bool {
            let mut leadership = self.handle.leadership();
            let decided = timeout(WAIT, leadership.wait_for(Option::is_some))
                .await
                .expect("no decision in time")
                .unwrap();
            decided.unwrap_or_default()
        }

        async fn next_broadcast(&mut self) -> Message {
            timeout(WAIT, self.broadcasts.recv())
                .await
                .expect("nothing broadcast in time")
                .expect("broadcast queue closed")
        }

        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            timeout(WAIT, self.task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn lone_engine_becomes_leader() {
        let harness = Harness::spawn(30);

        assert!(harness.decision().await);
        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.node_id, "me");

        harness.stop().await;
    }

    #[tokio::test]
    async fn weaker_peer_is_bullied_back() {
        let mut harness = Harness::spawn(80);

        harness.hear("b", Message::election("b", 20)).await;
        let bully = harness.next_broadcast().await;
        assert_eq!(bully, Message::election("me", 80));

        assert!(harness.decision().await);
        harness.stop().await;
    }

    #[tokio::test]
    async fn stronger_peer_makes_a_follower() {
        let mut harness = Harness::spawn(20);

        harness.hear("b", Message::election("b", 80)).await;
        assert!(!harness.decision().await);

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.biggest_bully_seen, Some(80));
        assert!(harness.broadcasts.try_recv().is_err());

        harness.stop().await;
    }

    #[tokio::test]
    async fn collision_rerolls_the_announced_priority() {
        let mut harness = Harness::spawn(42);

        harness.hear("b", Message::election("b", 42)).await;
        let status = harness.handle.status().await.unwrap();
        assert_ne!(status.priority, 42);
        assert_eq!(harness.priority.get(), status.priority);
        assert!(harness.broadcasts.try_recv().is_err());

        harness.stop().await;
    }

    #[tokio::test]
    async fn follower_nominates_itself_once_per_lost_peer() {
        let mut harness = Harness::spawn(20);
        harness.hear("b", Message::election("b", 80)).await;
        assert!(!harness.decision().await);

        harness.peer_down.send("b".to_string()).await.unwrap();
        let nomination = harness.next_broadcast().await;
        assert_eq!(nomination, Message::election("me", 20));

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.self_nominations, 1);
        assert_eq!(status.biggest_bully_seen, None);
        assert!(harness.broadcasts.try_recv().is_err());

        harness.stop().await;
    }

    #[tokio::test]
    async fn leader_ignores_lost_peers() {
        let mut harness = Harness::spawn(90);
        assert!(harness.decision().await);

        harness.peer_down.send("b".to_string()).await.unwrap();
        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.self_nominations, 0);
        assert!(harness.broadcasts.try_recv().is_err());

        harness.stop().await;
    }

    #[tokio::test]
    async fn snapshots_flow_both_ways() {
        let mut harness = Harness::spawn(90);
        assert!(harness.decision().await);

        harness.store.write("now_playing", json!("song-1")).await;
        let Payload::StateSync(sent) = harness.next_broadcast().await.payload else {
            panic!("expected a state sync");
        };
        assert_eq!(sent.entries.get("now_playing"), Some(&json!("song-1")));

        let incoming = StateSnapshot::new([("volume".to_string(), json!(7))].into());
        harness.hear("b", Message::state_sync("b", incoming)).await;
        // The status round trip orders us after the snapshot was applied.
        harness.handle.status().await.unwrap();
        assert_eq!(harness.store.read("volume"), Some(json!(7)));
        assert_eq!(harness.store.read("now_playing"), None);

        harness.stop().await;
    }
}
