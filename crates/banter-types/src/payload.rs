//! Inner payloads carried inside `SECURE_MSG` envelopes after AEAD-open.
//! Wire shape is `{type, data, msg_id?}`; the payload enums are adjacently
//! tagged and the optional `msg_id` sits beside them via `Envelope`.

use serde::{Deserialize, Serialize};

use crate::{MemberInfo, MessageBroadcast, MessageInfo, RoomInfo, UserInfo};

/// The decrypted plaintext of a secure frame: a payload plus the optional
/// delivery id the reliable dispatcher tracks ACKs by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    #[serde(flatten)]
    pub payload: P,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

impl<P> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            msg_id: None,
        }
    }

    pub fn with_msg_id(payload: P, msg_id: String) -> Self {
        Self {
            payload,
            msg_id: Some(msg_id),
        }
    }
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientPayload {
    Hello,
    Login {
        email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Logout,
    Status,
    MergeSession {
        old_session_id: String,
        old_session_key: String,
    },
    ListRooms,
    CreateRoom {
        name: String,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    ListMembers {
        room_id: String,
    },
    ListMessages {
        room_id: String,
    },
    Message {
        room_id: String,
        content: String,
    },
    AiMessage {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Ack {
        msg_id: String,
    },
}

/// Replies and broadcasts the server produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerPayload {
    Welcome {
        user: UserInfo,
    },
    Status {
        session_id: String,
        user: Option<UserInfo>,
    },
    Error {
        message: String,
    },
    PleaseLogin {
        message: String,
        email: String,
    },
    Unauthorised {
        message: String,
    },
    MergeSessionFailed,
    RoomList(Vec<RoomInfo>),
    RoomCreated {
        room_id: String,
        name: String,
    },
    RoomJoined {
        room_id: String,
        name: String,
    },
    RoomLeft {
        room_id: String,
        name: String,
    },
    RoomMembers(Vec<MemberInfo>),
    RoomHistory(Vec<MessageInfo>),
    Message(MessageBroadcast),
    MemberJoined {
        room_id: String,
        member: MemberInfo,
    },
    MemberLeft {
        room_id: String,
        member_id: String,
    },
    Ack {
        msg_id: String,
    },
}

impl ServerPayload {
    /// `ACK` and `STATUS` replies are immediate and unreliable; everything
    /// else carries user-visible semantics and goes through the reliable
    /// dispatcher with a fresh `msg_id`.
    pub fn is_immediate(&self) -> bool {
        matches!(self, ServerPayload::Ack { .. } | ServerPayload::Status { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_without_data_parses() {
        let env: Envelope<ClientPayload> =
            serde_json::from_str(r#"{"type":"HELLO"}"#).unwrap();
        assert_eq!(env.payload, ClientPayload::Hello);
        assert_eq!(env.msg_id, None);
    }

    #[test]
    fn msg_id_sits_beside_type_and_data() {
        let env = Envelope::with_msg_id(
            ClientPayload::Message {
                room_id: "r1".into(),
                content: "hi".into(),
            },
            "m1".into(),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "MESSAGE");
        assert_eq!(value["data"]["room_id"], "r1");
        assert_eq!(value["msg_id"], "m1");
    }

    #[test]
    fn login_password_is_optional() {
        let env: Envelope<ClientPayload> =
            serde_json::from_str(r#"{"type":"LOGIN","data":{"email":"a@x.io"}}"#).unwrap();
        assert_eq!(
            env.payload,
            ClientPayload::Login {
                email: "a@x.io".into(),
                password: None
            }
        );
    }

    #[test]
    fn merge_session_field_names() {
        let raw = r#"{"type":"MERGE_SESSION","data":{"old_session_id":"s0","old_session_key":"k0"}}"#;
        let env: Envelope<ClientPayload> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            env.payload,
            ClientPayload::MergeSession {
                old_session_id: "s0".into(),
                old_session_key: "k0".into()
            }
        );
    }

    #[test]
    fn room_list_serializes_as_array() {
        let payload = ServerPayload::RoomList(vec![RoomInfo {
            room_id: "r1".into(),
            name: "general".into(),
            last_active_at: Some(100),
        }]);
        let value = serde_json::to_value(Envelope::new(payload)).unwrap();
        assert_eq!(value["type"], "ROOM_LIST");
        assert!(value["data"].is_array());
        assert_eq!(value["data"][0]["name"], "general");
    }

    #[test]
    fn merge_session_failed_has_no_data() {
        let json =
            serde_json::to_string(&Envelope::new(ServerPayload::MergeSessionFailed)).unwrap();
        assert_eq!(json, r#"{"type":"MERGE_SESSION_FAILED"}"#);
    }

    #[test]
    fn unknown_payload_type_rejected() {
        let raw = r#"{"type":"SHRUG","data":{}}"#;
        assert!(serde_json::from_str::<Envelope<ClientPayload>>(raw).is_err());
    }

    #[test]
    fn immediate_classification() {
        assert!(ServerPayload::Ack { msg_id: "m".into() }.is_immediate());
        assert!(ServerPayload::Status {
            session_id: "s".into(),
            user: None
        }
        .is_immediate());
        assert!(!ServerPayload::Error {
            message: "x".into()
        }
        .is_immediate());
    }
}
