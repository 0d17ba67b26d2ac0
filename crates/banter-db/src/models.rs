/// Database row types — these map directly to SQLite rows.
/// Distinct from banter-types wire structs to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub password: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub session_id: String,
    pub user_id: Option<i64>,
    pub session_key: String,
    pub remote_addr: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
}

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: i64,
    pub room_id: String,
    pub name: String,
    pub is_private: bool,
    pub created_at: i64,
    pub last_active_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub room_id: i64,
    pub user_id: i64,
    pub is_admin: bool,
    pub joined_at: i64,
}

/// Member joined with its user row, as listed in `ROOM_MEMBERS`.
#[derive(Debug, Clone)]
pub struct MemberView {
    pub user_id: String,
    pub name: String,
    pub is_admin: bool,
    pub joined_at: i64,
}

/// Message joined with its sender, as listed in `ROOM_HISTORY` and fanned
/// out in `MESSAGE` broadcasts.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub id: i64,
    pub sender_user_id: String,
    pub sender_name: String,
    pub content: String,
    pub is_announcement: bool,
    pub created_at: i64,
}
