use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version. Increment this and add a new migration function
/// to the `MIGRATIONS` array when the schema changes.
const CURRENT_VERSION: u32 = 1;

/// Each migration is a function that takes a connection and applies changes.
/// Migrations are applied sequentially starting from the current version + 1.
type MigrationFn = fn(&Connection) -> Result<()>;

/// Ordered list of migrations. Index 0 = version 1, index 1 = version 2, etc.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = get_current_version(conn)?;
    info!(
        "database schema version: {} (latest: {})",
        current, CURRENT_VERSION
    );

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    // Each migration + version bump runs in one transaction. BEGIN IMMEDIATE
    // acquires the write lock up front so concurrent writers cannot
    // interleave; on error the whole migration rolls back.
    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("applying migration v{}", version);

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match MIGRATIONS[idx](conn) {
            Ok(()) => {
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
                conn.execute_batch("COMMIT")?;
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK").ok();
                return Err(anyhow::anyhow!("migration v{} failed: {}", version, e));
            }
        }
    }

    info!("database migrations complete (now at v{})", CURRENT_VERSION);
    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: initial schema. Internal integer ids everywhere; public random
/// ids (`user_id`, `session_id`, `room_id`) only where an entity crosses the
/// wire. Timestamps are unix seconds.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL UNIQUE,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password    TEXT,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL UNIQUE,
            user_id         INTEGER REFERENCES users(id) ON DELETE SET NULL,
            session_key     TEXT NOT NULL UNIQUE,
            remote_addr     TEXT,
            created_at      INTEGER NOT NULL,
            last_active_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nonces (
            session_id  INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            nonce       TEXT NOT NULL,
            PRIMARY KEY (session_id, nonce)
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id         TEXT NOT NULL UNIQUE,
            name            TEXT NOT NULL UNIQUE,
            is_private      INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            last_active_at  INTEGER
        );

        CREATE TABLE IF NOT EXISTS members (
            room_id    INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            is_admin   INTEGER NOT NULL DEFAULT 0,
            joined_at  INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id          INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id          INTEGER NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            is_announcement  INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);
        ",
    )?;
    Ok(())
}
