//! Login, logout, status and session-merge handlers.
//!
//! Two account shapes: passwordless (login succeeds on email alone, the
//! account is created on first sight) and password-protected (argon2 PHC
//! hash stored; `LOGIN` without the password gets `PLEASE_LOGIN`, with a
//! wrong one `UNAUTHORISED`).

use anyhow::{Context, Result};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use tracing::info;
use uuid::Uuid;

use banter_db::models::UserRow;
use banter_gateway::{ActiveSession, Gateway};
use banter_types::{RoomRef, ServerPayload, UserInfo};

/// Upper bound on password length; keeps argon2 work bounded.
const MAX_PASSWORD_LEN: usize = 128;

pub fn login(
    gateway: &Gateway,
    session: &ActiveSession,
    email: &str,
    password: Option<&str>,
) -> Result<ServerPayload> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Ok(ServerPayload::Error {
            message: "Please provide a valid email address".to_string(),
        });
    }
    if password.map(|p| p.len() > MAX_PASSWORD_LEN).unwrap_or(false) {
        return Ok(ServerPayload::Unauthorised {
            message: "Incorrect password".to_string(),
        });
    }

    let user = match gateway.db.user_by_email(&email)? {
        Some(user) => user,
        None => {
            let name = email.split('@').next().unwrap_or(&email).to_string();
            let user_id = Uuid::new_v4().simple().to_string();
            match gateway.db.create_user(&user_id, &name, &email, None) {
                Ok(user) => user,
                // Lost a race with a concurrent login for the same address.
                Err(e) if banter_db::is_constraint_violation(&e) => gateway
                    .db
                    .user_by_email(&email)?
                    .context("user row vanished after conflict")?,
                Err(e) => return Err(e),
            }
        }
    };

    if let Some(hash) = &user.password {
        let Some(password) = password else {
            return Ok(ServerPayload::PleaseLogin {
                message: "Please type your password to continue".to_string(),
                email,
            });
        };
        if !verify_password(hash, password) {
            return Ok(ServerPayload::Unauthorised {
                message: "Incorrect password".to_string(),
            });
        }
    }

    gateway.db.bind_session_user(session.db_id, Some(user.id))?;
    gateway
        .sessions
        .set_user(&session.session_id, Some(user.id));
    info!(user = %user.user_id, session = %session.session_id, "user logged in");

    Ok(ServerPayload::Welcome {
        user: user_info(gateway, &user)?,
    })
}

pub fn logout(gateway: &Gateway, session: &ActiveSession) -> Result<ServerPayload> {
    gateway.db.bind_session_user(session.db_id, None)?;
    gateway.sessions.set_user(&session.session_id, None);
    Ok(ServerPayload::Status {
        session_id: session.session_id.clone(),
        user: None,
    })
}

pub fn status(gateway: &Gateway, session: &ActiveSession) -> Result<ServerPayload> {
    let row = gateway
        .db
        .session_by_public_id(&session.session_id)?
        .context("session row missing")?;

    let user = match row.user_id {
        Some(user_id) => gateway.db.user_by_id(user_id)?,
        None => None,
    };
    let user = user.map(|u| user_info(gateway, &u)).transpose()?;

    Ok(ServerPayload::Status {
        session_id: session.session_id.clone(),
        user,
    })
}

pub fn merge(
    gateway: &Gateway,
    session: &ActiveSession,
    old_session_id: &str,
    old_session_key: &str,
) -> Result<ServerPayload> {
    match gateway.merge_session(session, old_session_id, old_session_key)? {
        Some(user) => Ok(ServerPayload::Welcome {
            user: user_info(gateway, &user)?,
        }),
        None => Ok(ServerPayload::MergeSessionFailed),
    }
}

/// User snapshot with the most recently active room attached.
pub fn user_info(gateway: &Gateway, user: &UserRow) -> Result<UserInfo> {
    let room = gateway.db.last_room_for_user(user.id)?.map(|room| RoomRef {
        room_id: room.room_id,
        name: room.name,
    });
    Ok(UserInfo {
        user_id: user.user_id.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        room,
    })
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Just enough validation to keep junk out of the unique email column.
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace)
}
