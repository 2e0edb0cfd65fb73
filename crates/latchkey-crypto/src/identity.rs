//! Long-lived identity keys.
//!
//! One identity per account installation. The 32-byte seed is the only
//! secret persisted; the Ed25519 signing key and the X25519 agreement key are
//! both derived from it.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    keys::{KEY_SIZE, KeyPair, PublicKey},
};

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Label used to derive the agreement key from the identity seed
const AGREEMENT_LABEL: &[u8] = b"latchkeyIdentityAgreementV1";

/// Identity key pair (Ed25519 signing + X25519 agreement).
#[derive(Clone)]
pub struct IdentityKeyPair {
    seed: Zeroizing<[u8; KEY_SIZE]>,
    signing: SigningKey,
    agreement: KeyPair,
}

impl IdentityKeyPair {
    /// Rebuild an identity from its seed.
    ///
    /// Deterministic: the same seed always yields the same identity.
    #[must_use]
    pub fn from_seed(seed: [u8; KEY_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&seed);

        let hkdf = Hkdf::<Sha256>::new(None, &seed);
        let mut agreement_secret = Zeroizing::new([0u8; KEY_SIZE]);
        let Ok(()) = hkdf.expand(AGREEMENT_LABEL, agreement_secret.as_mut()) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };

        Self {
            seed: Zeroizing::new(seed),
            signing,
            agreement: KeyPair::from_secret_bytes(*agreement_secret),
        }
    }

    /// The persisted secret seed.
    #[must_use]
    pub fn seed(&self) -> &[u8; KEY_SIZE] {
        &self.seed
    }

    /// Public half, safe to upload.
    #[must_use]
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            agreement: self.agreement.public_key(),
        }
    }

    /// Sign a message with the identity signing key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    pub(crate) fn agreement(&self) -> &KeyPair {
        &self.agreement
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for IdentityKeyPair {}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Serialize for IdentityKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (*self.seed).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IdentityKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seed = Zeroizing::new(<[u8; KEY_SIZE]>::deserialize(deserializer)?);
        Ok(Self::from_seed(*seed))
    }
}

/// Public identity: Ed25519 verifying key plus X25519 agreement key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    signing: [u8; KEY_SIZE],
    agreement: PublicKey,
}

impl IdentityPublicKey {
    /// Encoded size: signing key followed by agreement key.
    pub const SIZE: usize = 2 * KEY_SIZE;

    /// Concatenated encoding (`signing || agreement`).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..KEY_SIZE].copy_from_slice(&self.signing);
        out[KEY_SIZE..].copy_from_slice(self.agreement.as_bytes());
        out
    }

    /// Decode from the concatenated encoding.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Truncated` if fewer than [`Self::SIZE`] bytes
    /// - `CryptoError::InvalidPublicKey` if the signing key is not a valid
    ///   Ed25519 point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SIZE {
            return Err(CryptoError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        }

        let mut signing = [0u8; KEY_SIZE];
        signing.copy_from_slice(&bytes[..KEY_SIZE]);
        VerifyingKey::from_bytes(&signing).map_err(|_| CryptoError::InvalidPublicKey)?;

        let mut agreement = [0u8; KEY_SIZE];
        agreement.copy_from_slice(&bytes[KEY_SIZE..]);

        Ok(Self { signing, agreement: PublicKey::from_bytes(agreement) })
    }

    /// X25519 half, used as the recipient of device name encryption.
    #[must_use]
    pub fn agreement_key(&self) -> PublicKey {
        self.agreement
    }

    /// Verify an identity signature.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidPublicKey` if the signing key does not decode
    /// - `CryptoError::InvalidSignature` if the signature is malformed or does
    ///   not verify
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.signing).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;

        key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}
