//! Per-session security state: handshake, frame admission with replay
//! protection, address mobility, session merge, idle expiry.
//!
//! The database is the durable source of truth for sessions and accepted
//! nonces (the replay window survives restarts); the in-memory index is the
//! hot cache the receive path and broadcast fan-out read from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use banter_crypto::{generate_session_key, oaep_wrap, open, random_id, SESSION_KEY_LEN};
use banter_db::models::UserRow;
use banter_db::now_ts;
use banter_types::{ClientPayload, Envelope, ServerFrame};

use crate::Gateway;

/// Snapshot of a live session handed to workers and the dispatcher.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub db_id: i64,
    pub session_id: String,
    pub key: [u8; SESSION_KEY_LEN],
    pub addr: SocketAddr,
    pub user_id: Option<i64>,
}

struct Entry {
    session: ActiveSession,
    last_seen: Instant,
}

/// In-memory map from `session_id` to live session state.
///
/// Guarded by `std::sync::RwLock`: every critical section is a map lookup
/// or small mutation and nothing is held across channel sends or I/O.
pub struct SessionIndex {
    inner: RwLock<HashMap<String, Entry>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, session: ActiveSession) {
        let mut map = self.inner.write().expect("session index poisoned");
        map.insert(
            session.session_id.clone(),
            Entry {
                session,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<ActiveSession> {
        let map = self.inner.read().expect("session index poisoned");
        map.get(session_id).map(|e| e.session.clone())
    }

    /// Refresh activity and the remote address after an accepted frame.
    pub fn touch(&self, session_id: &str, addr: SocketAddr) {
        let mut map = self.inner.write().expect("session index poisoned");
        if let Some(entry) = map.get_mut(session_id) {
            entry.session.addr = addr;
            entry.last_seen = Instant::now();
        }
    }

    pub fn set_user(&self, session_id: &str, user_id: Option<i64>) {
        let mut map = self.inner.write().expect("session index poisoned");
        if let Some(entry) = map.get_mut(session_id) {
            entry.session.user_id = user_id;
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<ActiveSession> {
        let mut map = self.inner.write().expect("session index poisoned");
        map.remove(session_id).map(|e| e.session)
    }

    pub fn any_for_addr(&self, addr: &SocketAddr) -> bool {
        let map = self.inner.read().expect("session index poisoned");
        map.values().any(|e| e.session.addr == *addr)
    }

    /// Resolve users to their live sessions for broadcast fan-out.
    pub fn sessions_for_users(&self, user_ids: &[i64]) -> Vec<ActiveSession> {
        let map = self.inner.read().expect("session index poisoned");
        map.values()
            .filter(|e| {
                e.session
                    .user_id
                    .map(|uid| user_ids.contains(&uid))
                    .unwrap_or(false)
            })
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn authenticated_len(&self) -> usize {
        let map = self.inner.read().expect("session index poisoned");
        map.values().filter(|e| e.session.user_id.is_some()).count()
    }

    /// Drop sessions idle past `timeout`; returns the removed ids.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut map = self.inner.write().expect("session index poisoned");
        let now = Instant::now();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of running a `SECURE_MSG` through the admission pipeline.
pub enum Admission {
    Accepted {
        session: ActiveSession,
        envelope: Envelope<ClientPayload>,
    },
    Rejected(Rejection),
}

pub enum Rejection {
    /// No such session. A cleartext `NO_SESSION` hint is only warranted
    /// when the source address provably holds another live session.
    UnknownSession { alternate_exists: bool },
    /// Nonce already accepted for this session; dropped silently.
    Replay,
    /// Tag mismatch or malformed hex; dropped silently to avoid an oracle.
    Decrypt,
    /// Decrypted fine but the inner JSON is not a known payload; the
    /// session is authenticated so an encrypted `ERROR` reply is safe.
    Malformed {
        session: ActiveSession,
        message: String,
    },
}

impl Gateway {
    /// Handshake: mint a session bound to the source address, wrap the new
    /// session key to the client's public key and sign the raw key bytes.
    pub fn handle_session_init(
        &self,
        client_key_b64: &str,
        addr: SocketAddr,
    ) -> Result<ServerFrame> {
        let client_der = BASE64
            .decode(client_key_b64)
            .context("client_key is not valid base64")?;

        let key = generate_session_key();
        let wrapped = oaep_wrap(&client_der, &key)?;
        let signature = self.identity.pss_sign(&key);

        let session_id = random_id();
        let row = self
            .db
            .create_session(&session_id, &hex::encode(key), &addr.to_string())?;
        self.sessions.insert(ActiveSession {
            db_id: row.id,
            session_id: session_id.clone(),
            key,
            addr,
            user_id: None,
        });
        info!(%session_id, %addr, "session established");

        Ok(ServerFrame::SessionInit {
            session_id,
            encrypted_key: hex::encode(wrapped),
            signature: hex::encode(signature),
            server_pubkey: hex::encode(self.identity.public_key_der()),
            fingerprint: self.identity.fingerprint().to_string(),
        })
    }

    /// Admission pipeline for a `SECURE_MSG`: session lookup, replay check,
    /// authenticated decryption, payload parse, activity refresh — in that
    /// order, so a replayed frame never reaches the cipher and a forged one
    /// never reaches a handler.
    pub fn admit(
        &self,
        session_id: &str,
        nonce_hex: &str,
        ciphertext_hex: &str,
        addr: SocketAddr,
    ) -> Result<Admission> {
        let session = match self.lookup_session(session_id, addr)? {
            Some(session) => session,
            None => {
                self.metrics
                    .unknown_session_drops
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(Admission::Rejected(Rejection::UnknownSession {
                    alternate_exists: self.sessions.any_for_addr(&addr),
                }));
            }
        };

        let (nonce, ciphertext) = match (hex::decode(nonce_hex), hex::decode(ciphertext_hex)) {
            (Ok(n), Ok(c)) => (n, c),
            _ => {
                self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(Admission::Rejected(Rejection::Decrypt));
            }
        };

        // Canonical lowercase hex so case variants of one nonce collide.
        if !self.db.record_nonce(session.db_id, &hex::encode(&nonce))? {
            self.metrics.replay_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(session_id, "replayed nonce rejected");
            return Ok(Admission::Rejected(Rejection::Replay));
        }

        let plaintext = match open(&session.key, &nonce, &ciphertext) {
            Ok(p) => p,
            Err(_) => {
                self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(Admission::Rejected(Rejection::Decrypt));
            }
        };

        let envelope: Envelope<ClientPayload> = match serde_json::from_slice(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                return Ok(Admission::Rejected(Rejection::Malformed {
                    session,
                    message: format!("malformed payload: {}", e),
                }));
            }
        };

        self.db.touch_session(session.db_id, &addr.to_string())?;
        self.sessions.touch(&session.session_id, addr);
        let mut session = session;
        session.addr = addr;

        Ok(Admission::Accepted { session, envelope })
    }

    fn lookup_session(&self, session_id: &str, addr: SocketAddr) -> Result<Option<ActiveSession>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(Some(session));
        }
        // Index miss: rebuild from the session row (e.g. after a restart).
        let Some(row) = self.db.session_by_public_id(session_id)? else {
            return Ok(None);
        };
        let key_bytes = hex::decode(&row.session_key).context("stored session key not hex")?;
        let key: [u8; SESSION_KEY_LEN] = key_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored session key has wrong length"))?;
        let session = ActiveSession {
            db_id: row.id,
            session_id: row.session_id,
            key,
            addr,
            user_id: row.user_id,
        };
        self.sessions.insert(session.clone());
        Ok(Some(session))
    }

    /// Claim a prior session's user binding after a reconnect. The caller
    /// must present the old session's id and key; on success the binding
    /// moves to `current` and the old session is destroyed everywhere.
    /// Returns the bound user, or `None` when verification failed.
    pub fn merge_session(
        &self,
        current: &ActiveSession,
        old_session_id: &str,
        old_session_key: &str,
    ) -> Result<Option<UserRow>> {
        let old_session_id = old_session_id.trim();
        let old_session_key = old_session_key.trim();
        if old_session_id.is_empty() || old_session_key.is_empty() {
            return Ok(None);
        }
        if old_session_id == current.session_id {
            return Ok(None);
        }
        let Some(old) = self.db.session_by_public_id(old_session_id)? else {
            return Ok(None);
        };
        if !old.session_key.eq_ignore_ascii_case(old_session_key) {
            return Ok(None);
        }
        let Some(user_id) = old.user_id else {
            return Ok(None);
        };
        let Some(user) = self.db.user_by_id(user_id)? else {
            return Ok(None);
        };

        self.db.bind_session_user(current.db_id, Some(user_id))?;
        self.db.delete_session(old.id)?;
        self.sessions.remove(&old.session_id);
        self.dispatcher.purge_session(&old.session_id);
        self.sessions.set_user(&current.session_id, Some(user_id));
        info!(
            from = %old.session_id,
            to = %current.session_id,
            user = %user.user_id,
            "session merged"
        );
        Ok(Some(user))
    }

    /// Idle-session sweep: evict from the index, purge pending deliveries,
    /// delete expired rows (nonces cascade with them).
    pub fn sweep_sessions(&self) -> Result<()> {
        let removed = self.sessions.sweep_idle(self.tuning.idle_timeout);
        for session_id in &removed {
            self.dispatcher.purge_session(session_id);
        }
        let threshold = now_ts() - self.tuning.idle_timeout.as_secs() as i64;
        let purged = self.db.expire_sessions_before(threshold)?;
        if !removed.is_empty() || purged > 0 {
            debug!(index = removed.len(), rows = purged, "expired idle sessions");
        }
        Ok(())
    }

    /// Cleartext `NO_SESSION` hint for addresses that hold another live
    /// session (step 1 of admission).
    pub fn send_no_session_hint(&self, addr: SocketAddr) {
        let frame = ServerFrame::Error {
            code: "NO_SESSION".to_string(),
        };
        if let Ok(bytes) = serde_json::to_vec(&frame) {
            self.dispatcher.transmit_frame(addr, bytes);
        }
    }
}
