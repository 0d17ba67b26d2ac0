//! Inner-payload dispatch. One handler per payload kind; the router owns
//! the cross-cutting rules: ACK anything bearing a `msg_id` before the
//! handler runs, enforce the per-operation auth level, map handler residue
//! to a generic `ERROR`, and pick the direct vs reliable reply path.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, warn};

use banter_db::models::UserRow;
use banter_gateway::{ActiveSession, Gateway};
use banter_types::{ClientPayload, Envelope, ServerPayload};

use crate::ai::AiBridge;
use crate::{ai, auth, messages, rooms};

pub struct Router {
    gateway: Arc<Gateway>,
    ai: AiBridge,
}

/// Outcome of resolving the session's user binding. The binding is read
/// fresh from the session row so an earlier `LOGIN` on the same session
/// (processed in FIFO order) is always visible.
enum Auth {
    User(UserRow),
    Deny(ServerPayload),
}

impl Router {
    pub fn new(gateway: Arc<Gateway>, ai: AiBridge) -> Self {
        Self { gateway, ai }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Process one admitted envelope end to end.
    pub fn handle(&self, session: &ActiveSession, envelope: Envelope<ClientPayload>) {
        if let Some(msg_id) = &envelope.msg_id {
            // Acknowledge receipt before the handler runs; never ACK an ACK.
            if !matches!(envelope.payload, ClientPayload::Ack { .. }) {
                let ack = ServerPayload::Ack {
                    msg_id: msg_id.clone(),
                };
                if let Err(e) = self.gateway.dispatcher.send_direct(session, ack) {
                    warn!(session_id = %session.session_id, error = %e, "failed to ACK");
                }
            }
        }

        let reply = match self.dispatch(session, envelope.payload) {
            Ok(reply) => reply,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "handler failed");
                Some(ServerPayload::Error {
                    message: "internal".to_string(),
                })
            }
        };

        if let Some(payload) = reply {
            self.deliver(session, payload);
        }
    }

    fn deliver(&self, session: &ActiveSession, payload: ServerPayload) {
        let result = if payload.is_immediate() {
            self.gateway.dispatcher.send_direct(session, payload)
        } else {
            self.gateway.dispatcher.enqueue(session, payload).map(|_| ())
        };
        if let Err(e) = result {
            warn!(session_id = %session.session_id, error = %e, "reply dropped");
        }
    }

    fn dispatch(
        &self,
        session: &ActiveSession,
        payload: ClientPayload,
    ) -> Result<Option<ServerPayload>> {
        match payload {
            // Session-level operations.
            ClientPayload::Hello | ClientPayload::Status => {
                auth::status(&self.gateway, session).map(Some)
            }
            ClientPayload::Login { email, password } => {
                auth::login(&self.gateway, session, &email, password.as_deref()).map(Some)
            }
            ClientPayload::MergeSession {
                old_session_id,
                old_session_key,
            } => auth::merge(&self.gateway, session, &old_session_id, &old_session_key).map(Some),
            ClientPayload::Ack { msg_id } => {
                self.gateway
                    .dispatcher
                    .acknowledge(&session.session_id, &msg_id);
                Ok(None)
            }

            // User-level operations.
            ClientPayload::Logout => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(_) => auth::logout(&self.gateway, session).map(Some),
            },
            ClientPayload::ListRooms => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(_) => rooms::list(&self.gateway).map(Some),
            },
            ClientPayload::CreateRoom { name } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => rooms::create(&self.gateway, &user, &name).map(Some),
            },
            ClientPayload::JoinRoom { room_id } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => rooms::join(&self.gateway, &user, &room_id).map(Some),
            },
            ClientPayload::LeaveRoom { room_id } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => rooms::leave(&self.gateway, &user, &room_id).map(Some),
            },
            ClientPayload::ListMembers { room_id } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => rooms::members(&self.gateway, &user, &room_id).map(Some),
            },
            ClientPayload::ListMessages { room_id } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => messages::history(&self.gateway, &user, &room_id).map(Some),
            },
            ClientPayload::Message { room_id, content } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => messages::post(&self.gateway, &user, &room_id, &content),
            },
            ClientPayload::AiMessage { room_id, content } => match self.require_user(session)? {
                Auth::Deny(reply) => Ok(Some(reply)),
                Auth::User(user) => {
                    ai::request(&self.gateway, &self.ai, &user, &room_id, content.as_deref())
                }
            },
        }
    }

    fn require_user(&self, session: &ActiveSession) -> Result<Auth> {
        let Some(row) = self.gateway.db.session_by_public_id(&session.session_id)? else {
            return Ok(Auth::Deny(ServerPayload::Error {
                message: "Invalid session".to_string(),
            }));
        };
        let Some(user_id) = row.user_id else {
            return Ok(Auth::Deny(ServerPayload::Unauthorised {
                message: "Authentication required".to_string(),
            }));
        };
        match self.gateway.db.user_by_id(user_id)? {
            Some(user) => Ok(Auth::User(user)),
            None => Ok(Auth::Deny(ServerPayload::Unauthorised {
                message: "Authentication required".to_string(),
            })),
        }
    }
}

/// Bump a metric counter without the call-site noise.
pub(crate) fn bump(counter: &std::sync::atomic::AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
