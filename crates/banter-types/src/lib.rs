pub mod payload;
pub mod wire;

pub use payload::{ClientPayload, Envelope, ServerPayload};
pub use wire::{ClientFrame, ServerFrame};

use serde::{Deserialize, Serialize};

/// Hard cap on a single outbound datagram. Frames above this are dropped
/// at the transmit choke point rather than fragmented.
pub const MAX_FRAME_BYTES: usize = 60 * 1024;

/// AEAD nonce length in bytes (hex-encoded to 24 chars on the wire).
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length, appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// User snapshot sent in `WELCOME` and `STATUS` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub email: String,
    /// The room the user was most recently active in, if any.
    pub room: Option<RoomRef>,
}

/// Minimal room reference embedded in other payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRef {
    pub room_id: String,
    pub name: String,
}

/// Room entry in `ROOM_LIST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub name: String,
    pub last_active_at: Option<i64>,
}

/// Member entry in `ROOM_MEMBERS` and `MEMBER_JOINED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: String,
    pub name: String,
    pub is_admin: bool,
    pub joined_at: i64,
}

/// Message entry in `ROOM_HISTORY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_id: i64,
    pub user_id: String,
    pub name: String,
    pub content: String,
    pub timestamp: i64,
}

/// A live message fan-out, one copy per member session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBroadcast {
    pub room_id: String,
    pub message_id: i64,
    pub user_id: String,
    pub name: String,
    pub content: String,
    pub timestamp: i64,
}
