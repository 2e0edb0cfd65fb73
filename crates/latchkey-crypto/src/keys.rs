//! X25519 key pairs for one-time and signed prekeys.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    identity::{IdentityKeyPair, SIGNATURE_SIZE},
};

/// Size of X25519 keys and agreement outputs in bytes.
pub const KEY_SIZE: usize = 32;

/// X25519 public key.
///
/// Contains no secret information and can be logged or uploaded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PublicKey({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        Self(*X25519PublicKey::from(secret).as_bytes())
    }
}

/// X25519 key pair.
///
/// The secret half is zeroized on drop. Serializes as the 32 secret bytes;
/// the public half is recomputed on load.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Builds a key pair from caller-provided secret bytes.
    ///
    /// Callers MUST provide cryptographically secure random bytes in
    /// production.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half of the pair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Secret bytes, zeroized when the returned buffer is dropped.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 agreement with a peer public key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidPublicKey` if the peer key is a low-order point
    ///   (the agreement would not be contributory)
    pub(crate) fn agree(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&peer.to_x25519());
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for KeyPair {}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.secret_bytes();
        (*bytes).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Zeroizing::new(<[u8; KEY_SIZE]>::deserialize(deserializer)?);
        Ok(Self::from_secret_bytes(*bytes))
    }
}

/// Freshly generated signed prekey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKey {
    /// Device-scoped key id
    pub key_id: u32,
    /// The X25519 key pair
    pub key_pair: KeyPair,
    /// Identity signature over the public key bytes
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Generate a signed prekey under the given identity.
///
/// The signature covers the 32 public key bytes and verifies with
/// [`crate::IdentityPublicKey::verify`].
pub fn generate_signed_pre_key(
    identity: &IdentityKeyPair,
    key_id: u32,
    secret: [u8; KEY_SIZE],
) -> SignedPreKey {
    let key_pair = KeyPair::from_secret_bytes(secret);
    let signature = identity.sign(key_pair.public_key().as_bytes());
    SignedPreKey { key_id, key_pair, signature }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_derived_from_secret() {
        let a = KeyPair::from_secret_bytes([7; KEY_SIZE]);
        let b = KeyPair::from_secret_bytes([7; KEY_SIZE]);
        let c = KeyPair::from_secret_bytes([8; KEY_SIZE]);

        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn agreement_is_symmetric() {
        let alice = KeyPair::from_secret_bytes([1; KEY_SIZE]);
        let bob = KeyPair::from_secret_bytes([2; KEY_SIZE]);

        let ab = alice.agree(&bob.public_key()).unwrap();
        let ba = bob.agree(&alice.public_key()).unwrap();

        assert_eq!(*ab, *ba);
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice = KeyPair::from_secret_bytes([1; KEY_SIZE]);
        let zero = PublicKey::from_bytes([0; KEY_SIZE]);

        assert!(matches!(alice.agree(&zero), Err(CryptoError::InvalidPublicKey)));
    }

    #[test]
    fn signed_pre_key_signature_verifies() {
        let identity = IdentityKeyPair::from_seed([3; 32]);
        let spk = generate_signed_pre_key(&identity, 9, [4; KEY_SIZE]);

        assert_eq!(spk.key_id, 9);
        identity
            .public_key()
            .verify(spk.key_pair.public_key().as_bytes(), &spk.signature)
            .unwrap();
    }

    #[test]
    fn signature_from_other_identity_fails() {
        let identity = IdentityKeyPair::from_seed([3; 32]);
        let other = IdentityKeyPair::from_seed([5; 32]);
        let spk = generate_signed_pre_key(&identity, 1, [4; KEY_SIZE]);

        let result =
            other.public_key().verify(spk.key_pair.public_key().as_bytes(), &spk.signature);
        assert_eq!(result, Err(CryptoError::InvalidSignature));
    }
}
