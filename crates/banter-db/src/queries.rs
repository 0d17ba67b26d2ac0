use crate::models::{MemberRow, MemberView, MessageView, RoomRow, SessionRow, UserRow};
use crate::{now_ts, Database, OptionalExt};
use anyhow::Result;
use rusqlite::{params, Connection};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        user_id: &str,
        name: &str,
        email: &str,
        password: Option<&str>,
    ) -> Result<UserRow> {
        self.with_conn_mut(|conn| {
            let now = now_ts();
            conn.execute(
                "INSERT INTO users (user_id, name, email, password, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, name, email, password, now],
            )?;
            let id = conn.last_insert_rowid();
            Ok(UserRow {
                id,
                user_id: user_id.to_string(),
                name: name.to_string(),
                email: email.to_string(),
                password: password.map(str::to_string),
                created_at: now,
            })
        })
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email = ?1", params![email]))
    }

    pub fn user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", params![id]))
    }

    pub fn user_by_public_id(&self, user_id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "user_id = ?1", params![user_id]))
    }

    // -- Sessions --

    pub fn create_session(
        &self,
        session_id: &str,
        session_key: &str,
        remote_addr: &str,
    ) -> Result<SessionRow> {
        self.with_conn_mut(|conn| {
            let now = now_ts();
            conn.execute(
                "INSERT INTO sessions (session_id, session_key, remote_addr, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![session_id, session_key, remote_addr, now],
            )?;
            Ok(SessionRow {
                id: conn.last_insert_rowid(),
                session_id: session_id.to_string(),
                user_id: None,
                session_key: session_key.to_string(),
                remote_addr: Some(remote_addr.to_string()),
                created_at: now,
                last_active_at: now,
            })
        })
    }

    pub fn session_by_public_id(&self, session_id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, user_id, session_key, remote_addr, created_at, last_active_at
                 FROM sessions WHERE session_id = ?1",
            )?;
            stmt.query_row(params![session_id], session_from_row).optional()
        })
    }

    /// Refresh activity and record the current source address; sessions are
    /// address-mobile as long as the key proves identity.
    pub fn touch_session(&self, id: i64, remote_addr: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE sessions SET last_active_at = ?1, remote_addr = ?2 WHERE id = ?3",
                params![now_ts(), remote_addr, id],
            )?;
            Ok(())
        })
    }

    pub fn bind_session_user(&self, id: i64, user_id: Option<i64>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE sessions SET user_id = ?1, last_active_at = ?2 WHERE id = ?3",
                params![user_id, now_ts(), id],
            )?;
            Ok(())
        })
    }

    pub fn delete_session(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Delete sessions idle since before `threshold`; nonce rows cascade.
    pub fn expire_sessions_before(&self, threshold: i64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM sessions WHERE last_active_at < ?1",
                params![threshold],
            )?;
            Ok(n)
        })
    }

    // -- Nonces --

    /// Record an accepted nonce for a session. Returns `false` when the
    /// `(session_id, nonce)` pair was already present — the replay signal.
    /// The unique-constraint insert makes the check race-free across workers.
    pub fn record_nonce(&self, session_db_id: i64, nonce: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO nonces (session_id, nonce) VALUES (?1, ?2)",
                params![session_db_id, nonce],
            )?;
            Ok(n > 0)
        })
    }

    // -- Rooms --

    /// Insert the room and its creator's admin membership atomically.
    pub fn create_room_with_admin(
        &self,
        room_id: &str,
        name: &str,
        creator_user_id: i64,
    ) -> Result<RoomRow> {
        self.with_conn_mut(|conn| {
            let now = now_ts();
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<i64> {
                conn.execute(
                    "INSERT INTO rooms (room_id, name, is_private, created_at, last_active_at)
                     VALUES (?1, ?2, 0, ?3, ?3)",
                    params![room_id, name, now],
                )?;
                let id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO members (room_id, user_id, is_admin, joined_at)
                     VALUES (?1, ?2, 1, ?3)",
                    params![id, creator_user_id, now],
                )?;
                Ok(id)
            })();
            match result {
                Ok(id) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(RoomRow {
                        id,
                        room_id: room_id.to_string(),
                        name: name.to_string(),
                        is_private: false,
                        created_at: now,
                        last_active_at: Some(now),
                    })
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    Err(e)
                }
            }
        })
    }

    pub fn room_by_public_id(&self, room_id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, "room_id = ?1", params![room_id]))
    }

    pub fn room_by_name(&self, name: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, "name = ?1", params![name]))
    }

    pub fn list_public_rooms(&self) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, name, is_private, created_at, last_active_at
                 FROM rooms WHERE is_private = 0 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], room_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_room(&self, id: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE rooms SET last_active_at = ?1 WHERE id = ?2",
                params![now_ts(), id],
            )?;
            Ok(())
        })
    }

    /// The room the user was most recently active in, restored on login.
    pub fn last_room_for_user(&self, user_db_id: i64) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rooms.id, rooms.room_id, rooms.name, rooms.is_private,
                        rooms.created_at, rooms.last_active_at
                 FROM rooms
                 JOIN members ON rooms.id = members.room_id
                 WHERE members.user_id = ?1
                 ORDER BY rooms.last_active_at DESC
                 LIMIT 1",
            )?;
            stmt.query_row(params![user_db_id], room_from_row).optional()
        })
    }

    pub fn count_rooms(&self) -> Result<i64> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))?))
    }

    // -- Members --

    /// Idempotent membership insert. Returns `true` only when a new row was
    /// created, which is also the signal to broadcast `MEMBER_JOINED`.
    pub fn add_member(&self, room_id: i64, user_id: i64, is_admin: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO members (room_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![room_id, user_id, is_admin, now_ts()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn member(&self, room_id: i64, user_id: i64) -> Result<Option<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, user_id, is_admin, joined_at
                 FROM members WHERE room_id = ?1 AND user_id = ?2",
            )?;
            stmt.query_row(params![room_id, user_id], |row| {
                Ok(MemberRow {
                    room_id: row.get(0)?,
                    user_id: row.get(1)?,
                    is_admin: row.get(2)?,
                    joined_at: row.get(3)?,
                })
            })
            .optional()
        })
    }

    pub fn remove_member(&self, room_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn room_members(&self, room_id: i64) -> Result<Vec<MemberView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT users.user_id, users.name, members.is_admin, members.joined_at
                 FROM members
                 JOIN users ON members.user_id = users.id
                 WHERE members.room_id = ?1
                 ORDER BY members.joined_at, users.name",
            )?;
            let rows = stmt
                .query_map(params![room_id], |row| {
                    Ok(MemberView {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        is_admin: row.get(2)?,
                        joined_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn member_user_ids(&self, room_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM members WHERE room_id = ?1")?;
            let rows = stmt
                .query_map(params![room_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Earliest-joined member of a room, the admin-transfer target when the
    /// current admin leaves. Ties break on the internal user id.
    pub fn earliest_member(&self, room_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM members WHERE room_id = ?1
                 ORDER BY joined_at, user_id LIMIT 1",
            )?;
            stmt.query_row(params![room_id], |row| row.get(0)).optional()
        })
    }

    pub fn set_member_admin(&self, room_id: i64, user_id: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE members SET is_admin = 1 WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
            )?;
            Ok(())
        })
    }

    pub fn count_members(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM members", [], |r| r.get(0))?)
        })
    }

    // -- Messages --

    /// Append-only insert; ordering within a room is `(created_at, id)`.
    pub fn append_message(
        &self,
        room_id: i64,
        user_id: i64,
        content: &str,
        is_announcement: bool,
        created_at: i64,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (room_id, user_id, content, is_announcement, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![room_id, user_id, content, is_announcement, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Last `limit` messages of a room in ascending `(created_at, id)` order.
    pub fn recent_messages(&self, room_id: i64, limit: u32) -> Result<Vec<MessageView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_user_id, sender_name, content, is_announcement, created_at
                 FROM (
                     SELECT messages.id AS id,
                            users.user_id AS sender_user_id,
                            users.name AS sender_name,
                            messages.content AS content,
                            messages.is_announcement AS is_announcement,
                            messages.created_at AS created_at
                     FROM messages
                     JOIN users ON messages.user_id = users.id
                     WHERE messages.room_id = ?1
                     ORDER BY messages.created_at DESC, messages.id DESC
                     LIMIT ?2
                 )
                 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![room_id, limit], |row| {
                    Ok(MessageView {
                        id: row.get(0)?,
                        sender_user_id: row.get(1)?,
                        sender_name: row.get(2)?,
                        content: row.get(3)?,
                        is_announcement: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, user_id, name, email, password, created_at FROM users WHERE {}",
        predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row(params, |row| {
        Ok(UserRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            password: row.get(4)?,
            created_at: row.get(5)?,
        })
    })
    .optional()
}

fn query_room(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<RoomRow>> {
    let sql = format!(
        "SELECT id, room_id, name, is_private, created_at, last_active_at FROM rooms WHERE {}",
        predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row(params, room_from_row).optional()
}

fn room_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<RoomRow, rusqlite::Error> {
    Ok(RoomRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        name: row.get(2)?,
        is_private: row.get(3)?,
        created_at: row.get(4)?,
        last_active_at: row.get(5)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<SessionRow, rusqlite::Error> {
    Ok(SessionRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        session_key: row.get(3)?,
        remote_addr: row.get(4)?,
        created_at: row.get(5)?,
        last_active_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_constraint_violation;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn email_uniqueness_is_case_insensitive() {
        let db = db();
        db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let err = db.create_user("u2", "alice2", "Alice@X.IO", None).unwrap_err();
        assert!(is_constraint_violation(&err));

        let found = db.user_by_email("ALICE@x.io").unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
    }

    #[test]
    fn duplicate_nonce_is_reported_once() {
        let db = db();
        let sess = db.create_session("s1", "deadbeef", "127.0.0.1:1").unwrap();

        assert!(db.record_nonce(sess.id, "aabb").unwrap());
        assert!(!db.record_nonce(sess.id, "aabb").unwrap());
        // Same nonce value under a different session is a fresh pair.
        let other = db.create_session("s2", "cafebabe", "127.0.0.1:2").unwrap();
        assert!(db.record_nonce(other.id, "aabb").unwrap());
    }

    #[test]
    fn session_expiry_cascades_nonces() {
        let db = db();
        let sess = db.create_session("s1", "deadbeef", "127.0.0.1:1").unwrap();
        db.record_nonce(sess.id, "aabb").unwrap();

        let removed = db.expire_sessions_before(now_ts() + 10).unwrap();
        assert_eq!(removed, 1);
        assert!(db.session_by_public_id("s1").unwrap().is_none());

        // The pair is insertable again only because the old row is gone.
        let fresh = db.create_session("s1", "deadbeef", "127.0.0.1:1").unwrap();
        assert!(db.record_nonce(fresh.id, "aabb").unwrap());
    }

    #[test]
    fn create_room_makes_creator_admin() {
        let db = db();
        let user = db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let room = db.create_room_with_admin("r1", "general", user.id).unwrap();

        let member = db.member(room.id, user.id).unwrap().unwrap();
        assert!(member.is_admin);

        let err = db.create_room_with_admin("r2", "general", user.id).unwrap_err();
        assert!(is_constraint_violation(&err));
        // The failed insert must not leave a half-created room behind.
        assert!(db.room_by_public_id("r2").unwrap().is_none());
    }

    #[test]
    fn membership_is_idempotent() {
        let db = db();
        let user = db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let room = db.create_room_with_admin("r1", "general", user.id).unwrap();
        let other = db.create_user("u2", "bob", "bob@x.io", None).unwrap();

        assert!(db.add_member(room.id, other.id, false).unwrap());
        assert!(!db.add_member(room.id, other.id, false).unwrap());
        assert_eq!(db.room_members(room.id).unwrap().len(), 2);
    }

    #[test]
    fn earliest_member_is_admin_transfer_target() {
        let db = db();
        let alice = db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let bob = db.create_user("u2", "bob", "bob@x.io", None).unwrap();
        let carol = db.create_user("u3", "carol", "carol@x.io", None).unwrap();
        let room = db.create_room_with_admin("r1", "general", alice.id).unwrap();
        db.add_member(room.id, bob.id, false).unwrap();
        db.add_member(room.id, carol.id, false).unwrap();

        db.remove_member(room.id, alice.id).unwrap();
        let next = db.earliest_member(room.id).unwrap().unwrap();
        assert_eq!(next, bob.id);
    }

    #[test]
    fn message_order_breaks_ties_by_id() {
        let db = db();
        let user = db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let room = db.create_room_with_admin("r1", "general", user.id).unwrap();

        let m1 = db.append_message(room.id, user.id, "first", false, 100).unwrap();
        let m2 = db.append_message(room.id, user.id, "second", false, 100).unwrap();
        let m3 = db.append_message(room.id, user.id, "third", false, 99).unwrap();

        let history = db.recent_messages(room.id, 100).unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m3, m1, m2]);
    }

    #[test]
    fn history_window_keeps_newest_in_ascending_order() {
        let db = db();
        let user = db.create_user("u1", "alice", "alice@x.io", None).unwrap();
        let room = db.create_room_with_admin("r1", "general", user.id).unwrap();
        for i in 0..10 {
            db.append_message(room.id, user.id, &format!("m{}", i), false, i)
                .unwrap();
        }

        let history = db.recent_messages(room.id, 3).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9"]);
    }

    #[test]
    fn session_key_must_be_unique() {
        let db = db();
        db.create_session("s1", "samekey", "127.0.0.1:1").unwrap();
        let err = db.create_session("s2", "samekey", "127.0.0.1:2").unwrap_err();
        assert!(is_constraint_violation(&err));
    }
}
