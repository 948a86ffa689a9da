use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;

/// The replicated mapping: variable name to an opaque JSON value.
pub type StateMap = BTreeMap<String, Value>;

/// Identity of the local process as announced to discovery.
///
/// Peers only ever hold copies of this; the priority a peer holds is whatever
/// was last announced, the authoritative value lives in the election loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdentity {
    #[serde(rename = "node_id")]
    pub id: String,
    #[serde(rename = "url")]
    pub address: String,
    #[serde(default)]
    pub priority: u32,
}

impl NodeIdentity {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }
}

/// Where to reach a peer: its node id and the `host:port` it accepts on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id, self.address)
    }
}

/// Parses the `id=host:port` form used by `--peer`.
impl FromStr for PeerInfo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = s
            .split_once('=')
            .ok_or_else(|| format!("expected <id>=<host:port>, got '{s}'"))?;
        let (id, address) = (id.trim(), address.trim());
        if id.is_empty() || address.is_empty() {
            return Err(format!("peer id and address must be non-empty in '{s}'"));
        }
        Ok(Self::new(id, address))
    }
}

/// Full copy of the replicated mapping plus the time the leader produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// Unix milliseconds at the leader when the snapshot was taken.
    #[serde(rename = "ts")]
    pub taken_at: u64,
    #[serde(rename = "mem")]
    pub entries: StateMap,
}

impl StateSnapshot {
    pub fn new(entries: StateMap) -> Self {
        Self {
            taken_at: unix_millis(),
            entries,
        }
    }
}

/// A decoded cluster message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender_id: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sender's current priority.
    Election(u32),
    StateSync(StateSnapshot),
    Heartbeat,
}

impl Message {
    pub fn election(sender_id: impl Into<String>, priority: u32) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload: Payload::Election(priority),
        }
    }

    pub fn state_sync(sender_id: impl Into<String>, snapshot: StateSnapshot) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload: Payload::StateSync(snapshot),
        }
    }

    pub fn heartbeat(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload: Payload::Heartbeat,
        }
    }

    pub fn kind(&self) -> MessageType {
        match self.payload {
            Payload::Election(_) => MessageType::Bully,
            Payload::StateSync(_) => MessageType::SharedMemory,
            Payload::Heartbeat => MessageType::Heartbeat,
        }
    }

    /// Encodes the message as one JSON frame.
    pub fn encode(&self) -> Result<String, MeshError> {
        let content = match &self.payload {
            Payload::Election(priority) => Value::from(*priority),
            Payload::StateSync(snapshot) => serde_json::to_value(snapshot)?,
            Payload::Heartbeat => Value::Null,
        };
        let wire = WireMessage {
            node_id: self.sender_id.clone(),
            message_type: self.kind(),
            content,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decodes one JSON frame, resolving `content` by `message_type`.
    pub fn decode(frame: &str) -> Result<Self, MeshError> {
        let wire: WireMessage = serde_json::from_str(frame)?;
        let payload = match wire.message_type {
            MessageType::Bully => Payload::Election(serde_json::from_value(wire.content)?),
            MessageType::SharedMemory => Payload::StateSync(serde_json::from_value(wire.content)?),
            MessageType::Heartbeat => Payload::Heartbeat,
        };
        Ok(Self {
            sender_id: wire.node_id,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    #[serde(rename = "bullyMsg")]
    Bully,
    #[serde(rename = "shmMsg")]
    SharedMemory,
    #[serde(rename = "heartbeatMsg")]
    Heartbeat,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    node_id: String,
    message_type: MessageType,
    #[serde(default)]
    content: Value,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn election_frame_uses_wire_names() {
        let frame = Message::election("node-a", 42).encode().expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(
            value,
            json!({"node_id": "node-a", "message_type": "bullyMsg", "content": 42})
        );
    }

    #[test]
    fn decodes_state_sync_by_message_type() {
        let frame = r#"{"node_id":"leader","message_type":"shmMsg","content":{"ts":17,"mem":{"now_playing":{"id":3}}}}"#;
        let message = Message::decode(frame).expect("decode");

        assert_eq!(message.sender_id, "leader");
        let Payload::StateSync(snapshot) = message.payload else {
            panic!("expected state sync, got {:?}", message.payload);
        };
        assert_eq!(snapshot.taken_at, 17);
        assert_eq!(snapshot.entries.get("now_playing"), Some(&json!({"id": 3})));
    }

    #[test]
    fn heartbeat_content_is_optional() {
        let message = Message::decode(r#"{"node_id":"n","message_type":"heartbeatMsg"}"#)
            .expect("decode");
        assert_eq!(message.payload, Payload::Heartbeat);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let result = Message::decode(r#"{"node_id":"n","message_type":"gossipMsg","content":1}"#);
        assert!(matches!(result, Err(MeshError::Decode(_))));
    }

    #[test]
    fn rejects_mistyped_election_content() {
        let result = Message::decode(r#"{"node_id":"n","message_type":"bullyMsg","content":"high"}"#);
        assert!(matches!(result, Err(MeshError::Decode(_))));
    }

    #[test]
    fn parses_peer_flags() {
        let peer: PeerInfo = "abc=127.0.0.1:5001".parse().expect("valid peer");
        assert_eq!(peer, PeerInfo::new("abc", "127.0.0.1:5001"));

        assert!("127.0.0.1:5001".parse::<PeerInfo>().is_err());
        assert!("=127.0.0.1:5001".parse::<PeerInfo>().is_err());
    }
}
