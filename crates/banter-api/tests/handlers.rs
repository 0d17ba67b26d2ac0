//! Handler scenarios driven through the router against an in-memory
//! repository, with the transmit channel captured so every outbound frame
//! can be opened and asserted on.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use banter_api::{auth, AiBridge, Router};
use banter_crypto::{generate_session_key, random_id, RsaIdentity};
use banter_db::Database;
use banter_gateway::{ActiveSession, Gateway, Outbound, Tuning};
use banter_types::{ClientPayload, Envelope, ServerFrame, ServerPayload};

struct Harness {
    router: Router,
    rx: Receiver<Outbound>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = Arc::new(RsaIdentity::generate().unwrap());
        // No retry thread runs here; a long RTO keeps the frame captures
        // free of retransmissions regardless.
        let tuning = Tuning {
            rto_base: std::time::Duration::from_secs(60),
            ..Tuning::default()
        };
        let gateway = Arc::new(Gateway::new(db, identity, tuning, tx));
        Self {
            router: Router::new(gateway, AiBridge::disabled()),
            rx,
        }
    }

    fn gateway(&self) -> &Gateway {
        self.router.gateway()
    }

    /// Seed a handshaken session directly (the handshake itself is covered
    /// by the gateway tests).
    fn session(&self, port: u16) -> ActiveSession {
        let key = generate_session_key();
        let session_id = random_id();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let row = self
            .gateway()
            .db
            .create_session(&session_id, &hex::encode(key), &addr.to_string())
            .unwrap();
        let session = ActiveSession {
            db_id: row.id,
            session_id,
            key,
            addr,
            user_id: None,
        };
        self.gateway().sessions.insert(session.clone());
        session
    }

    fn login(&self, session: &ActiveSession, email: &str) {
        self.router.handle(
            session,
            Envelope::new(ClientPayload::Login {
                email: email.to_string(),
                password: None,
            }),
        );
        self.drain(session); // discard the WELCOME
    }

    /// All frames sent to `session` since the last call, opened.
    fn drain(&self, session: &ActiveSession) -> Vec<Envelope<ServerPayload>> {
        let mut out = Vec::new();
        for (addr, frame) in self.rx.try_iter() {
            if addr != session.addr {
                continue;
            }
            out.push(open_frame(&session.key, &frame));
        }
        out
    }

    /// Like `drain` but keeps every target, keyed by address.
    fn drain_all(&self, sessions: &[&ActiveSession]) -> Vec<(SocketAddr, Envelope<ServerPayload>)> {
        let mut out = Vec::new();
        for (addr, frame) in self.rx.try_iter() {
            let session = sessions
                .iter()
                .find(|s| s.addr == addr)
                .expect("frame for unknown session");
            out.push((addr, open_frame(&session.key, &frame)));
        }
        out
    }
}

fn open_frame(key: &[u8; 32], frame: &[u8]) -> Envelope<ServerPayload> {
    let ServerFrame::SecureMsg { nonce, ciphertext, .. } = serde_json::from_slice(frame).unwrap()
    else {
        panic!("expected SECURE_MSG");
    };
    let plaintext = banter_crypto::open(
        key,
        &hex::decode(nonce).unwrap(),
        &hex::decode(ciphertext).unwrap(),
    )
    .unwrap();
    serde_json::from_slice(&plaintext).unwrap()
}

#[test]
fn hello_is_acked_then_answered_with_null_status() {
    let h = Harness::new();
    let session = h.session(4100);

    h.router.handle(
        &session,
        Envelope::with_msg_id(ClientPayload::Hello, "m1".into()),
    );

    let frames = h.drain(&session);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0].payload,
        ServerPayload::Ack { msg_id: "m1".into() }
    );
    let ServerPayload::Status { ref session_id, ref user } = frames[1].payload else {
        panic!("expected STATUS, got {:?}", frames[1].payload);
    };
    assert_eq!(session_id, &session.session_id);
    assert!(user.is_none());
    // Immediate replies are untracked.
    assert_eq!(h.gateway().dispatcher.queue_depth(), 0);
}

#[test]
fn login_new_user_welcomes_and_binds() {
    let h = Harness::new();
    let session = h.session(4101);

    h.router.handle(
        &session,
        Envelope::new(ClientPayload::Login {
            email: "Ada@Example.IO".into(),
            password: None,
        }),
    );

    let frames = h.drain(&session);
    assert_eq!(frames.len(), 1);
    let ServerPayload::Welcome { ref user } = frames[0].payload else {
        panic!("expected WELCOME");
    };
    assert_eq!(user.email, "ada@example.io");
    assert_eq!(user.name, "ada");
    assert!(user.room.is_none());
    let welcome_msg_id = frames[0].msg_id.clone().expect("WELCOME is reliable");

    // STATUS now reflects the binding.
    h.router
        .handle(&session, Envelope::new(ClientPayload::Status));
    let frames = h.drain(&session);
    let ServerPayload::Status { user: Some(ref user), .. } = frames[0].payload else {
        panic!("expected bound STATUS");
    };
    assert_eq!(user.email, "ada@example.io");

    // The client's ACK retires the WELCOME retry record.
    assert_eq!(h.gateway().dispatcher.queue_depth(), 1);
    h.router.handle(
        &session,
        Envelope::new(ClientPayload::Ack {
            msg_id: welcome_msg_id,
        }),
    );
    assert_eq!(h.gateway().dispatcher.queue_depth(), 0);
}

#[test]
fn password_login_dance() {
    let h = Harness::new();
    let session = h.session(4102);

    let hash = auth::hash_password("correct horse").unwrap();
    h.gateway()
        .db
        .create_user(&random_id(), "bee", "b@x.io", Some(&hash))
        .unwrap();

    h.router.handle(
        &session,
        Envelope::new(ClientPayload::Login {
            email: "b@x.io".into(),
            password: None,
        }),
    );
    let frames = h.drain(&session);
    assert!(matches!(
        frames[0].payload,
        ServerPayload::PleaseLogin { ref email, .. } if email == "b@x.io"
    ));

    h.router.handle(
        &session,
        Envelope::new(ClientPayload::Login {
            email: "b@x.io".into(),
            password: Some("wrong".into()),
        }),
    );
    let frames = h.drain(&session);
    assert!(matches!(frames[0].payload, ServerPayload::Unauthorised { .. }));

    h.router.handle(
        &session,
        Envelope::new(ClientPayload::Login {
            email: "b@x.io".into(),
            password: Some("correct horse".into()),
        }),
    );
    let frames = h.drain(&session);
    assert!(matches!(frames[0].payload, ServerPayload::Welcome { .. }));
}

#[test]
fn room_operations_require_a_user() {
    let h = Harness::new();
    let session = h.session(4103);

    h.router
        .handle(&session, Envelope::new(ClientPayload::ListRooms));
    let frames = h.drain(&session);
    assert!(matches!(
        frames[0].payload,
        ServerPayload::Unauthorised { .. }
    ));
}

#[test]
fn message_fan_out_carries_one_id_to_every_member() {
    let h = Harness::new();
    let s1 = h.session(4104);
    let s2 = h.session(4105);
    h.login(&s1, "alice@x.io");
    h.login(&s2, "bob@x.io");

    // Alice creates the room; the reply carries its id.
    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let frames = h.drain(&s1);
    let room_id = frames
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .expect("missing ROOM_CREATED");

    // Bob joins; both sides hear about it.
    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::JoinRoom {
            room_id: room_id.clone(),
        }),
    );
    let frames = h.drain_all(&[&s1, &s2]);
    let joins = frames
        .iter()
        .filter(|(_, f)| matches!(f.payload, ServerPayload::MemberJoined { .. }))
        .count();
    assert_eq!(joins, 2);

    // Alice speaks; both members receive the same message.
    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::Message {
            room_id: room_id.clone(),
            content: "hi".into(),
        }),
    );
    let frames = h.drain_all(&[&s1, &s2]);
    let deliveries: Vec<_> = frames
        .iter()
        .filter_map(|(addr, f)| match &f.payload {
            ServerPayload::Message(m) => Some((*addr, m.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(deliveries.len(), 2);
    let addrs: Vec<SocketAddr> = deliveries.iter().map(|(a, _)| *a).collect();
    assert!(addrs.contains(&s1.addr) && addrs.contains(&s2.addr));
    assert_eq!(deliveries[0].1.message_id, deliveries[1].1.message_id);
    assert_eq!(deliveries[0].1.timestamp, deliveries[1].1.timestamp);
    assert_eq!(deliveries[0].1.content, "hi");
}

#[test]
fn join_is_idempotent() {
    let h = Harness::new();
    let s1 = h.session(4106);
    let s2 = h.session(4107);
    h.login(&s1, "alice@x.io");
    h.login(&s2, "bob@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();

    for _ in 0..2 {
        h.router.handle(
            &s2,
            Envelope::new(ClientPayload::JoinRoom {
                room_id: room_id.clone(),
            }),
        );
    }
    let frames = h.drain_all(&[&s1, &s2]);
    let confirms = frames
        .iter()
        .filter(|(addr, f)| {
            *addr == s2.addr && matches!(f.payload, ServerPayload::RoomJoined { .. })
        })
        .count();
    let broadcasts = frames
        .iter()
        .filter(|(_, f)| matches!(f.payload, ServerPayload::MemberJoined { .. }))
        .count();
    assert_eq!(confirms, 2, "re-join must still confirm");
    assert_eq!(broadcasts, 2, "one MEMBER_JOINED per live member, once");

    let room = h.gateway().db.room_by_public_id(&room_id).unwrap().unwrap();
    assert_eq!(h.gateway().db.room_members(room.id).unwrap().len(), 2);
}

#[test]
fn leaving_a_room_you_are_not_in_confirms_without_broadcast() {
    let h = Harness::new();
    let s1 = h.session(4108);
    let s2 = h.session(4109);
    h.login(&s1, "alice@x.io");
    h.login(&s2, "bob@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();

    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::LeaveRoom {
            room_id: room_id.clone(),
        }),
    );
    let frames = h.drain_all(&[&s1, &s2]);
    assert!(frames.iter().any(|(addr, f)| {
        *addr == s2.addr && matches!(f.payload, ServerPayload::RoomLeft { .. })
    }));
    assert!(!frames
        .iter()
        .any(|(_, f)| matches!(f.payload, ServerPayload::MemberLeft { .. })));
}

#[test]
fn creator_leaving_hands_admin_to_next_joined() {
    let h = Harness::new();
    let s1 = h.session(4110);
    let s2 = h.session(4111);
    h.login(&s1, "alice@x.io");
    h.login(&s2, "bob@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();
    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::JoinRoom {
            room_id: room_id.clone(),
        }),
    );
    h.drain_all(&[&s1, &s2]);

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::LeaveRoom {
            room_id: room_id.clone(),
        }),
    );
    h.drain_all(&[&s1, &s2]);

    let room = h.gateway().db.room_by_public_id(&room_id).unwrap().unwrap();
    let bob = h.gateway().db.user_by_email("bob@x.io").unwrap().unwrap();
    let member = h.gateway().db.member(room.id, bob.id).unwrap().unwrap();
    assert!(member.is_admin, "admin must transfer to the next member");
}

#[test]
fn merge_session_moves_user_and_room_state() {
    let h = Harness::new();
    let s1 = h.session(4112);
    h.login(&s1, "alice@x.io");

    let old_key = h
        .gateway()
        .db
        .session_by_public_id(&s1.session_id)
        .unwrap()
        .unwrap()
        .session_key;

    // Reconnect: a brand-new handshaken session claims the old binding.
    let s2 = h.session(4113);
    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::MergeSession {
            old_session_id: s1.session_id.clone(),
            old_session_key: old_key,
        }),
    );
    let frames = h.drain(&s2);
    assert!(matches!(frames[0].payload, ServerPayload::Welcome { .. }));

    h.router.handle(&s2, Envelope::new(ClientPayload::Status));
    let frames = h.drain(&s2);
    let ServerPayload::Status { user: Some(ref user), .. } = frames[0].payload else {
        panic!("merged session lost the binding");
    };
    assert_eq!(user.email, "alice@x.io");

    // The old session is gone from the index and the store.
    assert!(h.gateway().sessions.get(&s1.session_id).is_none());
    assert!(h
        .gateway()
        .db
        .session_by_public_id(&s1.session_id)
        .unwrap()
        .is_none());
}

#[test]
fn merge_with_bad_credentials_fails_closed() {
    let h = Harness::new();
    let s1 = h.session(4114);
    h.login(&s1, "alice@x.io");
    let s2 = h.session(4115);

    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::MergeSession {
            old_session_id: s1.session_id.clone(),
            old_session_key: "00ff".into(),
        }),
    );
    let frames = h.drain(&s2);
    assert_eq!(frames[0].payload, ServerPayload::MergeSessionFailed);
    assert!(h.gateway().sessions.get(&s1.session_id).is_some());
}

#[test]
fn messages_require_membership() {
    let h = Harness::new();
    let s1 = h.session(4116);
    let s2 = h.session(4117);
    h.login(&s1, "alice@x.io");
    h.login(&s2, "bob@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();

    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::Message {
            room_id,
            content: "sneaky".into(),
        }),
    );
    let frames = h.drain(&s2);
    assert!(matches!(frames[0].payload, ServerPayload::Error { .. }));
}

#[test]
fn history_is_ascending_and_member_only() {
    let h = Harness::new();
    let s1 = h.session(4118);
    h.login(&s1, "alice@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();

    for content in ["one", "two", "three"] {
        h.router.handle(
            &s1,
            Envelope::new(ClientPayload::Message {
                room_id: room_id.clone(),
                content: content.into(),
            }),
        );
    }
    h.drain(&s1);

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::ListMessages {
            room_id: room_id.clone(),
        }),
    );
    let frames = h.drain(&s1);
    let ServerPayload::RoomHistory(ref history) = frames[0].payload else {
        panic!("expected ROOM_HISTORY");
    };
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    // A non-member is turned away.
    let s2 = h.session(4119);
    h.login(&s2, "bob@x.io");
    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::ListMessages { room_id }),
    );
    let frames = h.drain(&s2);
    assert!(matches!(frames[0].payload, ServerPayload::Error { .. }));
}

#[test]
fn ai_requests_need_membership_and_a_backend() {
    let h = Harness::new();
    let s1 = h.session(4120);
    h.login(&s1, "alice@x.io");

    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::CreateRoom {
            name: "general".into(),
        }),
    );
    let room_id = h
        .drain(&s1)
        .iter()
        .find_map(|f| match &f.payload {
            ServerPayload::RoomCreated { room_id, .. } => Some(room_id.clone()),
            _ => None,
        })
        .unwrap();

    // Member, but no backend configured.
    h.router.handle(
        &s1,
        Envelope::new(ClientPayload::AiMessage {
            room_id: room_id.clone(),
            content: None,
        }),
    );
    let frames = h.drain(&s1);
    assert!(matches!(frames[0].payload, ServerPayload::Error { .. }));

    // Non-member is rejected before the backend check.
    let s2 = h.session(4121);
    h.login(&s2, "bob@x.io");
    h.router.handle(
        &s2,
        Envelope::new(ClientPayload::AiMessage {
            room_id,
            content: None,
        }),
    );
    let frames = h.drain(&s2);
    assert!(matches!(frames[0].payload, ServerPayload::Error { .. }));
}
