//! Room lifecycle and membership handlers.

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use banter_db::models::{RoomRow, UserRow};
use banter_db::now_ts;
use banter_gateway::Gateway;
use banter_types::{MemberInfo, RoomInfo, ServerPayload};

pub fn list(gateway: &Gateway) -> Result<ServerPayload> {
    let rooms = gateway.db.list_public_rooms()?;
    Ok(ServerPayload::RoomList(
        rooms
            .into_iter()
            .map(|room| RoomInfo {
                room_id: room.room_id,
                name: room.name,
                last_active_at: room.last_active_at,
            })
            .collect(),
    ))
}

pub fn create(gateway: &Gateway, user: &UserRow, name: &str) -> Result<ServerPayload> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(ServerPayload::Error {
            message: "Room name is required".to_string(),
        });
    }
    if gateway.db.room_by_name(name)?.is_some() {
        return Ok(ServerPayload::Error {
            message: "Room with that name already exists".to_string(),
        });
    }

    let room_id = Uuid::new_v4().simple().to_string();
    let room = match gateway.db.create_room_with_admin(&room_id, name, user.id) {
        Ok(room) => room,
        // Raced another creator on the unique name.
        Err(e) if banter_db::is_constraint_violation(&e) => {
            return Ok(ServerPayload::Error {
                message: "Room with that name already exists".to_string(),
            });
        }
        Err(e) => return Err(e),
    };
    info!(room = %room.room_id, name = %room.name, creator = %user.user_id, "room created");

    gateway.broadcast_to_room(
        room.id,
        &ServerPayload::MemberJoined {
            room_id: room.room_id.clone(),
            member: MemberInfo {
                user_id: user.user_id.clone(),
                name: user.name.clone(),
                is_admin: true,
                joined_at: room.created_at,
            },
        },
    )?;

    Ok(ServerPayload::RoomCreated {
        room_id: room.room_id,
        name: room.name,
    })
}

pub fn join(gateway: &Gateway, user: &UserRow, room_id: &str) -> Result<ServerPayload> {
    let Some(room) = lookup(gateway, room_id)? else {
        return Ok(room_not_found());
    };

    // Idempotent: a second join is a no-op that still confirms.
    let newly_joined = gateway.db.add_member(room.id, user.id, false)?;
    if newly_joined {
        let joined_at = gateway
            .db
            .member(room.id, user.id)?
            .map(|m| m.joined_at)
            .unwrap_or_else(now_ts);
        gateway.broadcast_to_room(
            room.id,
            &ServerPayload::MemberJoined {
                room_id: room.room_id.clone(),
                member: MemberInfo {
                    user_id: user.user_id.clone(),
                    name: user.name.clone(),
                    is_admin: false,
                    joined_at,
                },
            },
        )?;
    }

    Ok(ServerPayload::RoomJoined {
        room_id: room.room_id,
        name: room.name,
    })
}

pub fn leave(gateway: &Gateway, user: &UserRow, room_id: &str) -> Result<ServerPayload> {
    let Some(room) = lookup(gateway, room_id)? else {
        return Ok(room_not_found());
    };

    let member = gateway.db.member(room.id, user.id)?;
    let Some(member) = member else {
        // Leaving a room one is not in confirms without a broadcast.
        return Ok(ServerPayload::RoomLeft {
            room_id: room.room_id,
            name: room.name,
        });
    };

    gateway.db.remove_member(room.id, user.id)?;

    // Admin hand-off to the earliest-joined remaining member. An empty
    // room persists; history stays reachable by room_id.
    if member.is_admin {
        if let Some(next_admin) = gateway.db.earliest_member(room.id)? {
            gateway.db.set_member_admin(room.id, next_admin)?;
        }
    }

    gateway.broadcast_to_room(
        room.id,
        &ServerPayload::MemberLeft {
            room_id: room.room_id.clone(),
            member_id: user.user_id.clone(),
        },
    )?;

    Ok(ServerPayload::RoomLeft {
        room_id: room.room_id,
        name: room.name,
    })
}

pub fn members(gateway: &Gateway, user: &UserRow, room_id: &str) -> Result<ServerPayload> {
    let Some(room) = lookup(gateway, room_id)? else {
        return Ok(room_not_found());
    };
    if gateway.db.member(room.id, user.id)?.is_none() {
        return Ok(not_a_member());
    }

    let members = gateway.db.room_members(room.id)?;
    Ok(ServerPayload::RoomMembers(
        members
            .into_iter()
            .map(|m| MemberInfo {
                user_id: m.user_id,
                name: m.name,
                is_admin: m.is_admin,
                joined_at: m.joined_at,
            })
            .collect(),
    ))
}

pub(crate) fn lookup(gateway: &Gateway, room_id: &str) -> Result<Option<RoomRow>> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Ok(None);
    }
    gateway.db.room_by_public_id(room_id)
}

pub(crate) fn room_not_found() -> ServerPayload {
    ServerPayload::Error {
        message: "Room not found".to_string(),
    }
}

pub(crate) fn not_a_member() -> ServerPayload {
    ServerPayload::Error {
        message: "You must join the room first".to_string(),
    }
}
