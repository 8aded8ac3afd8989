//! Credential hashing shared by both local protocols.

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// A 32-byte credential digest.
pub type AuthHash = [u8; 32];

/// Returns `sha1(data)`.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Returns `sha256` over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derives the credential digest: `sha256(sha1(username) ++ sha1(password))`.
///
/// This is the only credential-derived value that ever takes part in a KLAP
/// handshake.
pub fn auth_hash(username: &str, password: &str) -> AuthHash {
    sha256(&[&sha1(username.as_bytes()), &sha1(password.as_bytes())])
}
