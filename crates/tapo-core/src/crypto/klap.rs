//! KLAP handshake hashes and session cipher.
//!
//! After the two handshake rounds both sides hold the same `local_seed`,
//! `remote_seed` and credential digest. [`KlapCipher::derive`] turns those
//! into an AES-128-CBC key, a 12-byte IV prefix, a 28-byte signing key and an
//! initial sequence number. Every request then uses
//! `iv = base_iv ++ be32(seq)` and is framed as
//! `sha256(sig_key ++ be32(seq) ++ ciphertext) ++ ciphertext`.

use std::fmt;

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::crypto::auth::sha256;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Length of each handshake seed.
pub const SEED_LEN: usize = 16;

/// Length of the signature prefix on every framed message.
pub const SIGNATURE_LEN: usize = 32;

/// Computes the hash the device returns from handshake 1:
/// `sha256(local_seed ++ remote_seed ++ auth_hash)`.
pub fn server_hash(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[local_seed, remote_seed, auth_hash])
}

/// Computes the hash the client proves itself with in handshake 2:
/// `sha256(remote_seed ++ local_seed ++ auth_hash)`.
pub fn client_hash(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[remote_seed, local_seed, auth_hash])
}

/// Errors raised while framing or unframing KLAP messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KlapCipherError {
    /// The sequence counter cannot advance without wrapping.
    SequenceExhausted,
    /// Message is shorter than the signature prefix.
    Truncated,
    /// The signature does not match the ciphertext.
    SignatureMismatch,
    /// Padding or block decryption failed.
    DecryptionFailed,
}

impl fmt::Display for KlapCipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceExhausted => write!(f, "sequence exhausted"),
            Self::Truncated => write!(f, "message shorter than signature"),
            Self::SignatureMismatch => write!(f, "signature mismatch"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for KlapCipherError {}

/// Symmetric session material for one KLAP handshake.
///
/// The cipher owns the sequence counter. It only moves forward; once it would
/// wrap, [`KlapCipher::encrypt`] refuses and the session must be replaced by a
/// fresh handshake.
#[derive(Clone)]
pub struct KlapCipher {
    key: [u8; 16],
    base_iv: [u8; 12],
    sig_key: [u8; 28],
    seq: u32,
}

impl KlapCipher {
    /// Derives session material from the handshake values.
    pub fn derive(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let key_full = sha256(&[b"lsk", local_seed, remote_seed, auth_hash]);
        let iv_full = sha256(&[b"iv", local_seed, remote_seed, auth_hash]);
        let sig_full = sha256(&[b"ldk", local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_full[..16]);
        let mut base_iv = [0u8; 12];
        base_iv.copy_from_slice(&iv_full[..12]);
        let mut sig_key = [0u8; 28];
        sig_key.copy_from_slice(&sig_full[..28]);
        let seq = u32::from_be_bytes([iv_full[28], iv_full[29], iv_full[30], iv_full[31]]);

        Self {
            key,
            base_iv,
            sig_key,
            seq,
        }
    }

    /// Returns the sequence number of the most recent request.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[cfg(test)]
    pub(crate) fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Advances the sequence and frames `plaintext` under it.
    ///
    /// Returns the sequence used together with the framed message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), KlapCipherError> {
        let seq = self
            .seq
            .checked_add(1)
            .ok_or(KlapCipherError::SequenceExhausted)?;
        self.seq = seq;
        Ok((seq, self.encrypt_with_seq(plaintext, seq)))
    }

    /// Frames `plaintext` under an explicit sequence number without touching
    /// the counter. Devices answer a request using the request's sequence.
    pub fn encrypt_with_seq(&self, plaintext: &[u8], seq: u32) -> Vec<u8> {
        let iv = self.iv_for(seq);
        let ciphertext =
            Aes128CbcEnc::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut framed = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        framed.extend_from_slice(&self.signature(seq, &ciphertext));
        framed.extend_from_slice(&ciphertext);
        framed
    }

    /// Verifies and decrypts a framed message sent under `seq`.
    ///
    /// The signature is checked before any decryption takes place.
    pub fn decrypt(&self, framed: &[u8], seq: u32) -> Result<Vec<u8>, KlapCipherError> {
        if framed.len() < SIGNATURE_LEN {
            return Err(KlapCipherError::Truncated);
        }
        let (signature, ciphertext) = framed.split_at(SIGNATURE_LEN);
        if signature != self.signature(seq, ciphertext) {
            return Err(KlapCipherError::SignatureMismatch);
        }

        let iv = self.iv_for(seq);
        Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| KlapCipherError::DecryptionFailed)
    }

    fn iv_for(&self, seq: u32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.base_iv);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn signature(&self, seq: u32, ciphertext: &[u8]) -> [u8; 32] {
        sha256(&[&self.sig_key, &seq.to_be_bytes(), ciphertext])
    }
}

impl fmt::Debug for KlapCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapCipher")
            .field("seq", &self.seq)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
