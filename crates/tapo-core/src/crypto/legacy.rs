//! RSA key exchange and AES session cipher for the legacy protocol.
//!
//! The client sends a freshly generated RSA public key; the device answers
//! with `base64(rsa(aes_key ++ aes_iv))`. Every later message is
//! `base64(aes_128_cbc(json))` under that key and IV.

use std::fmt;

use aes::Aes128;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs8::{EncodePublicKey, LineEnding},
    rand_core::OsRng,
};

use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// RSA modulus size the devices accept.
pub const RSA_KEY_BITS: usize = 1024;

/// A per-connection RSA key pair.
pub struct LegacyKeyPair {
    private_key: RsaPrivateKey,
    public_pem: String,
}

impl LegacyKeyPair {
    /// Generates a new key pair. Never share one between devices.
    pub fn generate() -> Result<Self, Error> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::Protocol(format!("RSA key generation failed: {}", e)))?;
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Protocol(format!("RSA key encoding failed: {}", e)))?;

        Ok(Self {
            private_key,
            public_pem,
        })
    }

    /// PEM (SubjectPublicKeyInfo) encoding of the public half.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Decrypts the device's handshake key blob into a session cipher.
    pub fn decrypt_session_key(&self, encoded: &str) -> Result<LegacyCipher, Error> {
        let encrypted = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Protocol(format!("handshake key is not base64: {}", e)))?;
        let blob = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &encrypted)
            .map_err(|e| Error::Protocol(format!("RSA decrypt failed: {}", e)))?;

        if blob.len() != 32 {
            return Err(Error::Protocol(format!(
                "handshake key has unexpected length: {} (expected 32)",
                blob.len()
            )));
        }

        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&blob[..16]);
        iv.copy_from_slice(&blob[16..]);
        Ok(LegacyCipher::new(key, iv))
    }
}

impl fmt::Debug for LegacyKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyKeyPair")
            .field("bits", &RSA_KEY_BITS)
            .finish_non_exhaustive()
    }
}

/// AES-128-CBC cipher with a fixed key and IV for one legacy session.
#[derive(Clone)]
pub struct LegacyCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl LegacyCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Encrypts and base64-encodes `plaintext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        BASE64.encode(ciphertext)
    }

    /// Reverses [`LegacyCipher::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, Error> {
        let ciphertext = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Protocol(format!("response is not base64: {}", e)))?;
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Error::Protocol("AES decrypt failed".into()))
    }
}

impl fmt::Debug for LegacyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LegacyCipher([REDACTED])")
    }
}
