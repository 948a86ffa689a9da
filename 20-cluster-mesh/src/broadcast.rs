use std::future::Future;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::message::{Message, Payload};

/// Something that can hand one message to every connected peer.
pub trait Fanout: Send + Sync + 'static {
    /// Returns how many peers the message was queued for.
    fn broadcast_all(&self, message: Message) -> impl Future<Output = usize> + Send;
}

/// Single task that drains the "for everyone" queue in order.
///
/// Each peer sees broadcasts in the order they were queued here; nothing is
/// promised about how peers interleave with each other.
pub struct Broadcaster<F> {
    fanout: F,
    queue: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
}

impl<F: Fanout> Broadcaster<F> {
    pub fn new(fanout: F, queue: mpsc::Receiver<Message>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            fanout,
            queue,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = crate::shutdown_requested(&mut self.shutdown) => break,
                next = self.queue.recv() => {
                    let Some(message) = next else { break };
                    let delivered = self.fanout.broadcast_all(message.clone()).await;
                    if matches!(message.payload, Payload::Election(_)) {
                        debug!(peers = delivered, "bullying");
                    } else {
                        debug!(peers = delivered, kind = ?message.kind(), "broadcast");
                    }
                }
            }
        }
        self.queue.close();
        debug!("broadcaster stopped");
    }
}
