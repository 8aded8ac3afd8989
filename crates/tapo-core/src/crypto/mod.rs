//! Cryptographic building blocks for the two local Tapo protocols.
//!
//! - [`auth`]: credential digest shared by both protocols
//! - [`klap`]: KLAP handshake hashes and the sequence-keyed session cipher
//! - [`legacy`]: RSA key exchange and AES session cipher for older firmware

pub mod auth;
pub mod klap;
pub mod legacy;

pub use auth::{AuthHash, auth_hash};
pub use klap::{KlapCipher, KlapCipherError};
pub use legacy::{LegacyCipher, LegacyKeyPair};
