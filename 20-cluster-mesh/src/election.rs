//! Bully-style election state machine.
//!
//! Nodes compare priorities. Whoever goes `idle_timeout` without hearing a
//! stronger priority decides: it leads if its own priority is at least the
//! biggest one it has seen, otherwise it follows. Hearing a weaker priority
//! makes a node bully back; hearing an equal one makes it re-roll.
//!
//! This type does no I/O. The dispatch loop in [`crate::engine`] owns the
//! only instance and performs the announcements and notifications the
//! transitions ask for, which keeps every mutation on one task.

use std::{fmt, time::Duration};

use rand::{rngs::StdRng, Rng};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Undecided,
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Undecided => write!(f, "undecided"),
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// What an incoming election message did to the local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Same priority as ours; we drew a new one and stay quiet.
    Collision { rerolled_to: u32 },
    /// The sender is weaker; announce `priority` to everyone.
    Weaker { priority: u32 },
    /// The sender is stronger; we wait for the idle timeout again.
    Stronger,
}

pub struct Election {
    priority: u32,
    priority_range: u32,
    is_leader: bool,
    decided: bool,
    last_bullied_at: Instant,
    /// `None` is the "unknown" sentinel set on re-election; it loses to
    /// every priority.
    biggest_bully_seen: Option<u32>,
    idle_timeout: Duration,
    self_nominations: u64,
    rng: StdRng,
}

impl Election {
    /// `rng` drives collision re-rolls; seed it for reproducible runs.
    pub fn with_rng(
        priority: u32,
        priority_range: u32,
        idle_timeout: Duration,
        now: Instant,
        rng: StdRng,
    ) -> Self {
        Self {
            priority,
            priority_range: priority_range.max(2),
            is_leader: false,
            decided: false,
            last_bullied_at: now,
            biggest_bully_seen: Some(priority),
            idle_timeout,
            self_nominations: 0,
            rng,
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn role(&self) -> Role {
        match (self.decided, self.is_leader) {
            (false, _) => Role::Undecided,
            (true, true) => Role::Leader,
            (true, false) => Role::Follower,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn biggest_bully_seen(&self) -> Option<u32> {
        self.biggest_bully_seen
    }

    /// How many times a lost peer made this node nominate itself.
    pub fn self_nominations(&self) -> u64 {
        self.self_nominations
    }

    /// Timer branch. Returns the verdict when this tick decides the
    /// election; a decided election stays decided until something resets it.
    pub fn on_tick(&mut self, now: Instant) -> Option<bool> {
        if self.decided || now < self.last_bullied_at + self.idle_timeout {
            return None;
        }

        let outranks = self
            .biggest_bully_seen
            .map_or(true, |biggest| self.priority >= biggest);
        self.is_leader = outranks;
        self.decided = true;
        Some(self.is_leader)
    }

    pub fn on_election(&mut self, priority: u32, now: Instant) -> Observation {
        if priority == self.priority {
            self.reroll();
            return Observation::Collision {
                rerolled_to: self.priority,
            };
        }

        if priority < self.priority {
            self.reset(now);
            return Observation::Weaker {
                priority: self.priority,
            };
        }

        self.biggest_bully_seen = Some(priority);
        self.reset(now);
        Observation::Stronger
    }

    /// A connection was lost. Leaders ignore it; everyone else restarts the
    /// election and returns the priority to nominate themselves with.
    pub fn on_peer_down(&mut self, now: Instant) -> Option<u32> {
        if self.is_leader {
            return None;
        }

        self.biggest_bully_seen = None;
        self.reset(now);
        self.self_nominations += 1;
        Some(self.priority)
    }

    fn reset(&mut self, now: Instant) {
        self.is_leader = false;
        self.decided = false;
        self.last_bullied_at = now;
    }

    // Uniform over the range minus the current value, so a tie is always broken.
    fn reroll(&mut self) {
        let draw = self.rng.gen_range(0..self.priority_range - 1);
        self.priority = if draw >= self.priority { draw + 1 } else { draw };
    }
}
