//! Provisioning envelope cipher for linking a second device.
//!
//! The new device generates an ephemeral X25519 key pair and shows its public
//! half to the primary device. The primary seals the provisioning message:
//!
//! ```text
//! shared = X25519(sender ephemeral, recipient ephemeral)
//! key    = HKDF-SHA256(shared, "latchkeyProvisioningV1")
//! body   = version (1) || nonce (24) || XChaCha20-Poly1305(key, nonce, msg)
//! ```

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    keys::{KEY_SIZE, KeyPair, PublicKey},
};

/// Size of the random XChaCha20 nonce.
pub const PROVISIONING_NONCE_SIZE: usize = 24;

const ENVELOPE_VERSION: u8 = 1;

const PROVISIONING_LABEL: &[u8] = b"latchkeyProvisioningV1";

/// Sealed provisioning message as received over the provisioning channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionEnvelope {
    /// Sender's ephemeral public key
    pub public_key: PublicKey,
    /// `version || nonce || ciphertext`
    pub body: Vec<u8>,
}

/// Receiving side of provisioning; owns the ephemeral key pair.
#[derive(Debug, Clone)]
pub struct ProvisioningCipher {
    key_pair: KeyPair,
}

impl ProvisioningCipher {
    /// Create a cipher around a fresh ephemeral secret.
    #[must_use]
    pub fn new(ephemeral_secret: [u8; KEY_SIZE]) -> Self {
        Self { key_pair: KeyPair::from_secret_bytes(ephemeral_secret) }
    }

    /// Public key to publish in the provisioning URL.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key()
    }

    /// Open a provisioning envelope.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Truncated` if the body is shorter than its header
    /// - `CryptoError::UnsupportedVersion` for an unknown version byte
    /// - `CryptoError::InvalidPublicKey` if the sender key is a low-order point
    /// - `CryptoError::DecryptionFailed` if authentication fails
    pub fn decrypt(&self, envelope: &ProvisionEnvelope) -> Result<Vec<u8>, CryptoError> {
        let header = 1 + PROVISIONING_NONCE_SIZE;
        let body = envelope.body.as_slice();
        if body.len() < header {
            return Err(CryptoError::Truncated { expected: header, actual: body.len() });
        }
        if body[0] != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(body[0]));
        }

        let shared = self.key_pair.agree(&envelope.public_key)?;
        let key = envelope_key(&shared);
        let cipher = XChaCha20Poly1305::new(key.as_slice().into());

        cipher.decrypt(XNonce::from_slice(&body[1..header]), &body[header..]).map_err(|_| {
            CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
        })
    }
}

/// Seal a provisioning message to the linking device's ephemeral key.
///
/// Caller MUST provide cryptographically secure random bytes in production.
///
/// # Errors
///
/// - `CryptoError::InvalidPublicKey` if `recipient` is a low-order point
pub fn seal_provisioning_message(
    plaintext: &[u8],
    recipient: &PublicKey,
    ephemeral_secret: [u8; KEY_SIZE],
    nonce: [u8; PROVISIONING_NONCE_SIZE],
) -> Result<ProvisionEnvelope, CryptoError> {
    let sender = KeyPair::from_secret_bytes(ephemeral_secret);
    let shared = sender.agree(recipient)?;
    let key = envelope_key(&shared);
    let cipher = XChaCha20Poly1305::new(key.as_slice().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut body = Vec::with_capacity(1 + PROVISIONING_NONCE_SIZE + ciphertext.len());
    body.push(ENVELOPE_VERSION);
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&ciphertext);

    Ok(ProvisionEnvelope { public_key: sender.public_key(), body })
}

fn envelope_key(shared: &[u8; KEY_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let Ok(()) = hkdf.expand(PROVISIONING_LABEL, key.as_mut_slice()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_message_opens() {
        let cipher = ProvisioningCipher::new([7; KEY_SIZE]);
        let envelope =
            seal_provisioning_message(b"provision", &cipher.public_key(), [8; KEY_SIZE], [9; 24])
                .unwrap();

        assert_eq!(envelope.body[0], ENVELOPE_VERSION);
        assert_eq!(cipher.decrypt(&envelope).unwrap(), b"provision");
    }

    #[test]
    fn wrong_recipient_fails() {
        let intended = ProvisioningCipher::new([7; KEY_SIZE]);
        let other = ProvisioningCipher::new([6; KEY_SIZE]);
        let envelope =
            seal_provisioning_message(b"provision", &intended.public_key(), [8; KEY_SIZE], [9; 24])
                .unwrap();

        assert!(matches!(other.decrypt(&envelope), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let cipher = ProvisioningCipher::new([7; KEY_SIZE]);
        let mut envelope =
            seal_provisioning_message(b"x", &cipher.public_key(), [8; KEY_SIZE], [9; 24]).unwrap();
        envelope.body[0] = 2;

        assert_eq!(cipher.decrypt(&envelope), Err(CryptoError::UnsupportedVersion(2)));
    }

    #[test]
    fn short_body_is_truncated() {
        let cipher = ProvisioningCipher::new([7; KEY_SIZE]);
        let envelope = ProvisionEnvelope { public_key: cipher.public_key(), body: vec![1, 2, 3] };

        assert_eq!(
            cipher.decrypt(&envelope),
            Err(CryptoError::Truncated { expected: 25, actual: 3 })
        );
    }

    #[test]
    fn flipped_ciphertext_bit_fails() {
        let cipher = ProvisioningCipher::new([7; KEY_SIZE]);
        let mut envelope =
            seal_provisioning_message(b"payload", &cipher.public_key(), [8; KEY_SIZE], [9; 24])
                .unwrap();
        let last = envelope.body.len() - 1;
        envelope.body[last] ^= 0x80;

        assert!(matches!(cipher.decrypt(&envelope), Err(CryptoError::DecryptionFailed { .. })));
    }
}
