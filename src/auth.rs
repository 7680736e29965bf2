use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::frame::{MessageFooter, MessageHeader};

/// Client-side credential attached to a connect record.
pub struct Authorizer {
    pub protocol: u32,
    pub bytes: Bytes,
    /// Session key to install for message signing once the handshake succeeds.
    pub session_key: Option<Bytes>,
}

/// Server-side verdict on a received authorizer.
pub struct AuthCheck {
    pub valid: bool,
    /// Opaque reply bytes for the client (sent with the connect reply).
    pub reply: Bytes,
    /// Session key to install for message signing when `valid`.
    pub session_key: Option<Bytes>,
}

impl AuthCheck {
    pub fn accept() -> AuthCheck {
        AuthCheck {
            valid: true,
            reply: Bytes::new(),
            session_key: None,
        }
    }

    pub fn reject() -> AuthCheck {
        AuthCheck {
            valid: false,
            reply: Bytes::new(),
            session_key: None,
        }
    }
}

/// The authorization protocol is pluggable; the transport only moves its bytes and installs
///  the session key both sides derive.
pub trait AuthProvider: Send + Sync + 'static {
    /// Credential for an outgoing connect attempt. `force_new` is set on the retry after the
    ///  server rejected the previous authorizer.
    fn get_authorizer(&self, peer_type: u32, force_new: bool) -> Option<Authorizer>;

    /// Check a peer's authorizer. `protocol == 0` means the peer sent none.
    fn verify_authorizer(&self, peer_type: u32, protocol: u32, authorizer: &[u8]) -> AuthCheck;

    /// Verify the authorizer reply the server attached to READY/SEQ. Default accepts.
    fn verify_reply(&self, _authorizer: &Authorizer, _reply: &[u8]) -> bool {
        true
    }
}

/// Accepts everyone, carries no credentials. The default for clusters that authenticate at a
///  different layer.
pub struct NullAuth;

impl AuthProvider for NullAuth {
    fn get_authorizer(&self, _peer_type: u32, _force_new: bool) -> Option<Authorizer> {
        None
    }

    fn verify_authorizer(&self, _peer_type: u32, _protocol: u32, _authorizer: &[u8]) -> AuthCheck {
        AuthCheck::accept()
    }
}

/// Per-session message signer/verifier, installed from the session key the authorization
///  handshake produced.
///
/// The signature covers the envelope identity and all three payload checksums, so it is only
///  meaningful when checksums are enabled.
#[derive(Clone)]
pub struct SessionSecurity {
    key: Bytes,
}

impl SessionSecurity {
    pub fn new(key: Bytes) -> SessionSecurity {
        SessionSecurity { key }
    }

    fn compute(&self, header: &MessageHeader, footer: &MessageFooter) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(header.seq.to_le_bytes());
        hasher.update(header.tid.to_le_bytes());
        hasher.update(header.msg_type.to_le_bytes());
        hasher.update(header.front_len.to_le_bytes());
        hasher.update(header.middle_len.to_le_bytes());
        hasher.update(header.data_len.to_le_bytes());
        hasher.update(footer.front_crc.to_le_bytes());
        hasher.update(footer.middle_crc.to_le_bytes());
        hasher.update(footer.data_crc.to_le_bytes());

        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("SHA-256 digest is 32 bytes"))
    }

    pub fn sign(&self, header: &MessageHeader, footer: &mut MessageFooter) {
        footer.sig = self.compute(header, footer);
    }

    pub fn check_signature(&self, header: &MessageHeader, footer: &MessageFooter) -> bool {
        self.compute(header, footer) == footer.sig
    }
}
