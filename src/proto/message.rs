//! Message envelope and header.
//!
//! Every message carries the full header reflecting the sender's state at
//! send time — the header is the sole mechanism peers use to learn about
//! each other, there is no separate presence protocol. The advertisement
//! payload on the discovery channel is the bare header without
//! `type`/`content`.

use serde::{Deserialize, Serialize};

use crate::cluster::{NodeStatus, SelfInfo};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Ping,
    RequestSocket,
    AcceptConnection,
    AcceptClusterConnection,
    RejectConnection,
    SyncRequest,
    SyncClock,
    RequestStatus,
    StatusUpdate,
    ClientAcceptsChangeRole,
    MasterClusterInfoUpdate,
    ClientClusterInfoUpdate,
    NewClusterConnectionEstablished,
    ClusterConnectionLost,
    RttRequest,
    RttInit,
    RttBroadcast,
}

/// Sender state snapshot attached to every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "phoneId")]
    pub sender_id: String,
    #[serde(rename = "masterId", default)]
    pub master_id: String,
    #[serde(rename = "acceptsConnection")]
    pub accepts_connections: bool,
    #[serde(rename = "masterRank")]
    pub rank: u32,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "phoneName")]
    pub name: String,
    pub status: NodeStatus,
    #[serde(rename = "isMaster", default)]
    pub is_master: bool,
}

impl MessageHeader {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl From<&SelfInfo> for MessageHeader {
    fn from(info: &SelfInfo) -> Self {
        Self {
            sender_id: info.id.clone(),
            master_id: info.master_id.clone(),
            accepts_connections: info.accepts_connections,
            rank: info.rank,
            mac: info.mac.clone(),
            name: info.name.clone(),
            status: info.status,
            is_master: info.is_master,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub header: MessageHeader,
}

impl MeshMessage {
    pub const EMPTY_CONTENT: &'static str = "";

    pub fn new(kind: MessageType, content: impl Into<String>, info: &SelfInfo) -> Self {
        Self {
            kind,
            content: content.into(),
            header: MessageHeader::from(info),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.header.sender_id
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> SelfInfo {
        let mut info = SelfInfo::new(
            "node-a".into(),
            "alpha".into(),
            "02:00:00:00:01:00".into(),
            42,
        );
        info.master_id = "node-m".into();
        info
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = MeshMessage::new(MessageType::RequestSocket, "", &sample_info());
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"REQUEST_SOCKET\""));
        assert!(json.contains("\"phoneId\":\"node-a\""));
        assert!(json.contains("\"masterRank\":42"));
        assert!(json.contains("\"MAC\":\"02:00:00:00:01:00\""));
        assert!(json.contains("\"status\":\"UNDECIDED\""));
    }

    #[test]
    fn envelope_round_trips() {
        let msg = MeshMessage::new(MessageType::SyncClock, "123:456", &sample_info());
        let parsed = MeshMessage::from_json(&msg.to_json()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn bare_header_parses_as_advertisement() {
        let header = MessageHeader::from(&sample_info());
        let parsed = MessageHeader::from_json(&header.to_json()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"BOGUS","content":"","header":{}}"#;
        assert!(MeshMessage::from_json(raw).is_err());
    }
}
