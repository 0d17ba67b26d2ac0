//! Message append, fan-out and history handlers.

use anyhow::Result;

use banter_db::models::UserRow;
use banter_db::now_ts;
use banter_gateway::Gateway;
use banter_types::{MessageBroadcast, MessageInfo, ServerPayload};

use crate::router::bump;
use crate::rooms;

/// History window returned by `LIST_MESSAGES`.
const HISTORY_LIMIT: u32 = 100;

/// `MESSAGE`: append and broadcast to every member's live sessions,
/// including the sender's own for echo. No direct reply — the sender sees
/// the broadcast copy; members with no live session catch up via
/// `LIST_MESSAGES` on reconnect.
pub fn post(
    gateway: &Gateway,
    user: &UserRow,
    room_id: &str,
    content: &str,
) -> Result<Option<ServerPayload>> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(Some(ServerPayload::Error {
            message: "Room ID and content are required".to_string(),
        }));
    }
    let Some(room) = rooms::lookup(gateway, room_id)? else {
        return Ok(Some(rooms::room_not_found()));
    };
    if gateway.db.member(room.id, user.id)?.is_none() {
        return Ok(Some(ServerPayload::Error {
            message: "You must join the room before sending messages".to_string(),
        }));
    }

    append_and_broadcast(gateway, room.id, &room.room_id, user, content, false)?;
    Ok(None)
}

pub fn history(gateway: &Gateway, user: &UserRow, room_id: &str) -> Result<ServerPayload> {
    let Some(room) = rooms::lookup(gateway, room_id)? else {
        return Ok(rooms::room_not_found());
    };
    if gateway.db.member(room.id, user.id)?.is_none() {
        return Ok(rooms::not_a_member());
    }

    let messages = gateway.db.recent_messages(room.id, HISTORY_LIMIT)?;
    Ok(ServerPayload::RoomHistory(
        messages
            .into_iter()
            .map(|m| MessageInfo {
                message_id: m.id,
                user_id: m.sender_user_id,
                name: m.sender_name,
                content: m.content,
                timestamp: m.created_at,
            })
            .collect(),
    ))
}

/// Shared append path for user messages and assistant replies: one insert,
/// one room-activity touch, one reliable enqueue per live member session —
/// all copies carrying the same `message_id` and timestamp.
pub(crate) fn append_and_broadcast(
    gateway: &Gateway,
    room_db_id: i64,
    room_public_id: &str,
    author: &UserRow,
    content: &str,
    is_announcement: bool,
) -> Result<i64> {
    let created_at = now_ts();
    let message_id =
        gateway
            .db
            .append_message(room_db_id, author.id, content, is_announcement, created_at)?;
    gateway.db.touch_room(room_db_id)?;
    bump(&gateway.metrics.messages_sent);

    gateway.broadcast_to_room(
        room_db_id,
        &ServerPayload::Message(MessageBroadcast {
            room_id: room_public_id.to_string(),
            message_id,
            user_id: author.user_id.clone(),
            name: author.name.clone(),
            content: content.to_string(),
            timestamp: created_at,
        }),
    )?;
    Ok(message_id)
}
