//! Outer datagram frames. One JSON frame per datagram, UTF-8, tagged by
//! `type`. The two directions do not share field sets for `SESSION_INIT`,
//! so inbound and outbound frames are separate enums.

use serde::{Deserialize, Serialize};

/// Frames the server accepts off the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Handshake request carrying the client's RSA public key
    /// (base64-encoded DER SubjectPublicKeyInfo).
    #[serde(rename = "SESSION_INIT")]
    SessionInit { client_key: String },

    /// Encrypted envelope. `nonce` is 12 bytes hex, `ciphertext` is the
    /// AES-256-GCM output with the 16-byte tag appended, hex.
    #[serde(rename = "SECURE_MSG")]
    SecureMsg {
        session_id: String,
        nonce: String,
        ciphertext: String,
    },
}

/// Frames the server puts on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake reply: the wrapped session key, a PSS signature over the
    /// raw key bytes, and the server public key with its fingerprint for
    /// trust-on-first-use pinning.
    #[serde(rename = "SESSION_INIT")]
    SessionInit {
        session_id: String,
        encrypted_key: String,
        signature: String,
        server_pubkey: String,
        fingerprint: String,
    },

    #[serde(rename = "SECURE_MSG")]
    SecureMsg {
        session_id: String,
        nonce: String,
        ciphertext: String,
    },

    /// Cleartext error. Sent only when the source address provably holds
    /// another live session; everything else is dropped silently.
    #[serde(rename = "ERROR")]
    Error { code: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_session_init_parses() {
        let raw = r#"{"type":"SESSION_INIT","client_key":"AAAA"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SessionInit {
                client_key: "AAAA".into()
            }
        );
    }

    #[test]
    fn secure_msg_roundtrip() {
        let frame = ClientFrame::SecureMsg {
            session_id: "abc123".into(),
            nonce: "00".repeat(12),
            ciphertext: "ff".repeat(20),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"SECURE_MSG""#));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn server_session_init_shape() {
        let frame = ServerFrame::SessionInit {
            session_id: "s1".into(),
            encrypted_key: "aa".into(),
            signature: "bb".into(),
            server_pubkey: "cc".into(),
            fingerprint: "dd".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "SESSION_INIT");
        assert_eq!(value["encrypted_key"], "aa");
        assert_eq!(value["fingerprint"], "dd");
    }

    #[test]
    fn cleartext_error_shape() {
        let frame = ServerFrame::Error {
            code: "NO_SESSION".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"ERROR","code":"NO_SESSION"}"#);
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let raw = r#"{"type":"BOGUS","session_id":"x"}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }
}
