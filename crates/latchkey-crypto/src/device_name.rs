//! Device name encryption to the account identity key.
//!
//! All functions are pure - the ephemeral secret must be provided by the
//! caller.
//!
//! Construction:
//!
//! ```text
//! master     = X25519(ephemeral, identity agreement key)
//! auth_key   = HMAC(master, "auth")
//! siv        = HMAC(auth_key, plaintext)[..16]
//! cipher_key = HMAC(HMAC(master, "cipher"), siv)
//! ciphertext = ChaCha20-Poly1305(cipher_key, nonce = 0, plaintext)
//! ```
//!
//! The cipher key is unique per (ephemeral, plaintext), so the fixed nonce is
//! never reused under one key.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    identity::{IdentityKeyPair, IdentityPublicKey},
    keys::{KEY_SIZE, KeyPair, PublicKey},
};

type HmacSha256 = Hmac<Sha256>;

/// Size of the synthetic IV carried with every encrypted name
const SIV_SIZE: usize = 16;

/// Fixed nonce; the cipher key already depends on the SIV
const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// Encrypted device name as uploaded to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDeviceName {
    /// Ephemeral X25519 public key of the sender
    pub ephemeral_public: PublicKey,
    /// HMAC-derived IV, checked on decrypt
    pub synthetic_iv: [u8; SIV_SIZE],
    /// Ciphertext including the 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedDeviceName {
    /// Wire encoding: `ephemeral_public || synthetic_iv || ciphertext`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_SIZE + SIV_SIZE + self.ciphertext.len());
        out.extend_from_slice(self.ephemeral_public.as_bytes());
        out.extend_from_slice(&self.synthetic_iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode the wire encoding.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Truncated` if the input cannot hold the key and IV
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let header = KEY_SIZE + SIV_SIZE;
        if bytes.len() < header {
            return Err(CryptoError::Truncated { expected: header, actual: bytes.len() });
        }

        let mut ephemeral = [0u8; KEY_SIZE];
        ephemeral.copy_from_slice(&bytes[..KEY_SIZE]);
        let mut synthetic_iv = [0u8; SIV_SIZE];
        synthetic_iv.copy_from_slice(&bytes[KEY_SIZE..header]);

        Ok(Self {
            ephemeral_public: PublicKey::from_bytes(ephemeral),
            synthetic_iv,
            ciphertext: bytes[header..].to_vec(),
        })
    }
}

/// Encrypt a device name so only the holder of `identity` can read it.
///
/// # Errors
///
/// - `CryptoError::InvalidPublicKey` if the identity agreement key is a
///   low-order point
pub fn encrypt_device_name(
    name: &str,
    identity: &IdentityPublicKey,
    ephemeral_secret: [u8; KEY_SIZE],
) -> Result<EncryptedDeviceName, CryptoError> {
    let ephemeral = KeyPair::from_secret_bytes(ephemeral_secret);
    let master = ephemeral.agree(&identity.agreement_key())?;

    let auth_key = hmac(&master[..], b"auth");
    let full_iv = hmac(&auth_key[..], name.as_bytes());
    let mut synthetic_iv = [0u8; SIV_SIZE];
    synthetic_iv.copy_from_slice(&full_iv[..SIV_SIZE]);

    let key = cipher_key(&master, &synthetic_iv);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&ZERO_NONCE), name.as_bytes()) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Ok(EncryptedDeviceName { ephemeral_public: ephemeral.public_key(), synthetic_iv, ciphertext })
}

/// Decrypt a device name with the account identity key.
///
/// # Errors
///
/// - `CryptoError::InvalidPublicKey` if the ephemeral key is a low-order point
/// - `CryptoError::DecryptionFailed` if the tag or the synthetic IV does not
///   match
/// - `CryptoError::InvalidUtf8` if the plaintext is not a string
pub fn decrypt_device_name(
    encrypted: &EncryptedDeviceName,
    identity: &IdentityKeyPair,
) -> Result<String, CryptoError> {
    let master = identity.agreement().agree(&encrypted.ephemeral_public)?;

    let key = cipher_key(&master, &encrypted.synthetic_iv);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&ZERO_NONCE), encrypted.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })?;

    let auth_key = hmac(&master[..], b"auth");
    let mut mac = new_mac(&auth_key[..]);
    mac.update(&plaintext);
    mac.verify_truncated_left(&encrypted.synthetic_iv)
        .map_err(|_| CryptoError::DecryptionFailed { reason: "synthetic IV mismatch".to_string() })?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

fn cipher_key(master: &[u8; KEY_SIZE], synthetic_iv: &[u8; SIV_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
    let cipher_base = hmac(master, b"cipher");
    hmac(&cipher_base[..], synthetic_iv)
}

fn hmac(key: &[u8], data: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut mac = new_mac(key);
    mac.update(data);
    Zeroizing::new(mac.finalize().into_bytes().into())
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    let Ok(mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> IdentityKeyPair {
        IdentityKeyPair::from_seed([0x11; KEY_SIZE])
    }

    #[test]
    fn owner_can_decrypt() {
        let identity = identity();
        let encrypted =
            encrypt_device_name("Work laptop", &identity.public_key(), [0x22; KEY_SIZE]).unwrap();

        assert_eq!(decrypt_device_name(&encrypted, &identity).unwrap(), "Work laptop");
    }

    #[test]
    fn ciphertext_carries_tag() {
        let identity = identity();
        let encrypted = encrypt_device_name("abc", &identity.public_key(), [0x22; KEY_SIZE]).unwrap();

        assert_eq!(encrypted.ciphertext.len(), 3 + 16);
        assert_ne!(&encrypted.ciphertext[..3], b"abc");
    }

    #[test]
    fn other_identity_cannot_decrypt() {
        let encrypted =
            encrypt_device_name("phone", &identity().public_key(), [0x22; KEY_SIZE]).unwrap();
        let other = IdentityKeyPair::from_seed([0x33; KEY_SIZE]);

        assert!(matches!(
            decrypt_device_name(&encrypted, &other),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn tampered_iv_is_rejected() {
        let identity = identity();
        let mut encrypted =
            encrypt_device_name("phone", &identity.public_key(), [0x22; KEY_SIZE]).unwrap();
        encrypted.synthetic_iv[0] ^= 0x01;

        assert!(matches!(
            decrypt_device_name(&encrypted, &identity),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn wire_encoding_decodes() {
        let identity = identity();
        let encrypted =
            encrypt_device_name("tablet", &identity.public_key(), [0x44; KEY_SIZE]).unwrap();

        let decoded = EncryptedDeviceName::from_bytes(&encrypted.to_bytes()).unwrap();
        assert_eq!(decoded, encrypted);
        assert_eq!(decrypt_device_name(&decoded, &identity).unwrap(), "tablet");
    }

    #[test]
    fn short_wire_encoding_is_truncated() {
        assert_eq!(
            EncryptedDeviceName::from_bytes(&[0u8; 20]),
            Err(CryptoError::Truncated { expected: 48, actual: 20 })
        );
    }

    #[test]
    fn same_name_different_ephemeral_differs() {
        let public = identity().public_key();
        let a = encrypt_device_name("x", &public, [1; KEY_SIZE]).unwrap();
        let b = encrypt_device_name("x", &public, [2; KEY_SIZE]).unwrap();

        assert_ne!(a.synthetic_iv, b.synthetic_iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
