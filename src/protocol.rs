//! JSON wire protocol for the workspace collaboration channel.
//!
//! Every frame is a JSON object with a string tag `t` and an object
//! `payload`:
//!
//! ```text
//! { "t": "LOCK_ACQUIRE", "payload": { "blockId": "b1", "also": ["b2"] } }
//! ```
//!
//! Inbound frames with an unknown tag are ignored; frames that are not
//! valid JSON, carry no tag, or fail payload decoding are protocol
//! violations and close the session with code 1002.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WebSocket close codes used by the server.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol violation (malformed frame).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Internal server error.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Subscriber evicted for backpressure.
    pub const TRY_AGAIN: u16 = 1013;
    /// Room is at capacity.
    pub const ROOM_FULL: u16 = 4003;
}

fn default_release_lock() -> bool {
    true
}

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "payload")]
pub enum ClientFrame {
    /// Request exclusive edit ownership of a block, optionally together
    /// with a group of related blocks. All-or-nothing across the group.
    #[serde(rename = "LOCK_ACQUIRE", rename_all = "camelCase")]
    LockAcquire {
        block_id: String,
        #[serde(default)]
        also: Vec<String>,
    },

    /// Apply an edit to a block. `events` is the delta other clients
    /// replay; `workspace_xml` is the authoritative stored snapshot.
    /// Both are opaque to the server.
    #[serde(rename = "COMMIT", rename_all = "camelCase")]
    Commit {
        block_id: String,
        #[serde(default)]
        events: Vec<serde_json::Value>,
        #[serde(default)]
        workspace_xml: Option<String>,
        #[serde(default = "default_release_lock")]
        release_lock: bool,
        #[serde(default)]
        also: Vec<String>,
    },

    /// Liveness signal; refreshes the participant's last_seen.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {},
}

/// One participant as reported in `INIT_STATE` and `USER_JOINED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub client_id: Uuid,
    pub nickname: String,
    pub color: String,
}

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "payload")]
pub enum ServerFrame {
    /// First frame after admission: assigned id, current peers (excluding
    /// the receiver), current lease map, and the stored snapshot if any.
    #[serde(rename = "INIT_STATE", rename_all = "camelCase")]
    InitState {
        client_id: Uuid,
        users: Vec<UserEntry>,
        locks: HashMap<String, Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_xml: Option<String>,
    },

    #[serde(rename = "USER_JOINED", rename_all = "camelCase")]
    UserJoined {
        client_id: Uuid,
        nickname: String,
        color: String,
    },

    #[serde(rename = "USER_LEFT", rename_all = "camelCase")]
    UserLeft { client_id: Uuid },

    /// Lease state change for one block. `owner: null` means released.
    #[serde(rename = "LOCK_UPDATE", rename_all = "camelCase")]
    LockUpdate {
        block_id: String,
        owner: Option<Uuid>,
    },

    /// Acquisition refused; names the conflicting block, its holder, and
    /// the holder's remaining TTL in milliseconds.
    #[serde(rename = "LOCK_DENIED", rename_all = "camelCase")]
    LockDenied {
        block_id: String,
        owner: Uuid,
        ttl_ms: u64,
    },

    /// An accepted commit, fanned out to every subscriber including the
    /// sender (clients dedupe by `by`).
    #[serde(rename = "COMMIT_APPLY", rename_all = "camelCase")]
    CommitApply {
        block_id: String,
        events: Vec<serde_json::Value>,
        by: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_xml: Option<String>,
    },

    /// Commit refused because another participant holds the lease.
    #[serde(rename = "COMMIT_REJECTED", rename_all = "camelCase")]
    CommitRejected { block_id: String, owner: Uuid },
}

impl ServerFrame {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}

const CLIENT_TAGS: [&str; 3] = ["LOCK_ACQUIRE", "COMMIT", "HEARTBEAT"];

/// Parse an inbound text frame.
///
/// Returns `Ok(None)` for well-formed frames with an unknown tag (ignored
/// per protocol), `Err` for anything malformed.
pub fn parse_client_frame(text: &str) -> Result<Option<ClientFrame>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not an object".into()))?;
    let tag = obj
        .get("t")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing frame tag".into()))?;
    if !CLIENT_TAGS.contains(&tag) {
        return Ok(None);
    }
    if !obj.contains_key("payload") {
        return Err(ProtocolError::Malformed(format!("{tag}: missing payload")));
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Malformed(String),
    Serialize(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::Serialize(e) => write!(f, "frame serialization failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lock_acquire_decode() {
        let text = r#"{"t":"LOCK_ACQUIRE","payload":{"blockId":"b1","also":["b2","b3"]}}"#;
        let frame = parse_client_frame(text).unwrap().unwrap();
        assert_eq!(
            frame,
            ClientFrame::LockAcquire {
                block_id: "b1".into(),
                also: vec!["b2".into(), "b3".into()],
            }
        );
    }

    #[test]
    fn test_lock_acquire_also_defaults_empty() {
        let text = r#"{"t":"LOCK_ACQUIRE","payload":{"blockId":"b1"}}"#;
        let frame = parse_client_frame(text).unwrap().unwrap();
        match frame {
            ClientFrame::LockAcquire { also, .. } => assert!(also.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_commit_release_lock_defaults_true() {
        let text = r#"{"t":"COMMIT","payload":{"blockId":"b1","events":[]}}"#;
        let frame = parse_client_frame(text).unwrap().unwrap();
        match frame {
            ClientFrame::Commit {
                release_lock,
                workspace_xml,
                ..
            } => {
                assert!(release_lock);
                assert!(workspace_xml.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_commit_full_payload() {
        let text = r#"{"t":"COMMIT","payload":{"blockId":"b1","events":[{"k":"move"}],"workspaceXml":"<x/>","releaseLock":false,"also":["b2"]}}"#;
        let frame = parse_client_frame(text).unwrap().unwrap();
        assert_eq!(
            frame,
            ClientFrame::Commit {
                block_id: "b1".into(),
                events: vec![json!({"k": "move"})],
                workspace_xml: Some("<x/>".into()),
                release_lock: false,
                also: vec!["b2".into()],
            }
        );
    }

    #[test]
    fn test_heartbeat_decode() {
        let text = r#"{"t":"HEARTBEAT","payload":{}}"#;
        let frame = parse_client_frame(text).unwrap().unwrap();
        assert_eq!(frame, ClientFrame::Heartbeat {});
    }

    #[test]
    fn test_unknown_tag_ignored() {
        let text = r#"{"t":"CURSOR_MOVE","payload":{"x":1}}"#;
        assert_eq!(parse_client_frame(text).unwrap(), None);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(parse_client_frame("not json").is_err());
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(parse_client_frame("[1,2,3]").is_err());
    }

    #[test]
    fn test_missing_tag_is_malformed() {
        assert!(parse_client_frame(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_missing_payload_is_malformed() {
        assert!(parse_client_frame(r#"{"t":"HEARTBEAT"}"#).is_err());
    }

    #[test]
    fn test_bad_payload_shape_is_malformed() {
        // Known tag but payload missing the required blockId.
        assert!(parse_client_frame(r#"{"t":"LOCK_ACQUIRE","payload":{}}"#).is_err());
    }

    #[test]
    fn test_lock_update_encodes_null_owner() {
        let frame = ServerFrame::LockUpdate {
            block_id: "b1".into(),
            owner: None,
        };
        let encoded = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["t"], "LOCK_UPDATE");
        assert_eq!(value["payload"]["blockId"], "b1");
        assert!(value["payload"]["owner"].is_null());
    }

    #[test]
    fn test_init_state_omits_absent_snapshot() {
        let frame = ServerFrame::InitState {
            client_id: Uuid::new_v4(),
            users: Vec::new(),
            locks: HashMap::new(),
            workspace_xml: None,
        };
        let encoded = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert!(value["payload"].get("workspaceXml").is_none());
        assert!(value["payload"]["users"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_init_state_payload_shape() {
        let owner = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut locks = HashMap::new();
        locks.insert("b1".to_string(), owner);
        let frame = ServerFrame::InitState {
            client_id: me,
            users: vec![UserEntry {
                client_id: owner,
                nickname: "alice".into(),
                color: "#FF6B6B".into(),
            }],
            locks,
            workspace_xml: Some("<x/>".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["payload"]["clientId"], me.to_string());
        assert_eq!(value["payload"]["locks"]["b1"], owner.to_string());
        assert_eq!(value["payload"]["users"][0]["nickname"], "alice");
        assert_eq!(value["payload"]["workspaceXml"], "<x/>");
    }

    #[test]
    fn test_lock_denied_camel_case_fields() {
        let owner = Uuid::new_v4();
        let frame = ServerFrame::LockDenied {
            block_id: "b1".into(),
            owner,
            ttl_ms: 9500,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["t"], "LOCK_DENIED");
        assert_eq!(value["payload"]["ttlMs"], 9500);
        assert_eq!(value["payload"]["owner"], owner.to_string());
    }

    #[test]
    fn test_commit_apply_includes_sender() {
        let by = Uuid::new_v4();
        let frame = ServerFrame::CommitApply {
            block_id: "b1".into(),
            events: vec![json!({"k": "drag"})],
            by,
            workspace_xml: None,
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["payload"]["by"], by.to_string());
        assert!(value["payload"].get("workspaceXml").is_none());
    }
}
