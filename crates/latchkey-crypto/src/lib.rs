//! Latchkey Cryptographic Primitives
//!
//! Key material used by account registration and the key lifecycle. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Hierarchy
//!
//! ```text
//! Identity seed (32 bytes, one per installation)
//!        │
//!        ├──► Ed25519 signing key ──► signs signed prekeys
//!        │
//!        └──► HKDF → X25519 agreement key ──► device name encryption
//!
//! One-time prekeys   (X25519, single use, bulk replenished)
//! Signed prekeys     (X25519, medium lived, signature by identity key)
//! ```
//!
//! The identity seed is replaced only on account reset. Prekeys and signed
//! prekeys are generated in batches by the key lifecycle manager and
//! persisted by the record store; this crate never stores anything.
//!
//! # Device Names
//!
//! Device names are encrypted to the identity key with a synthetic-IV
//! construction: an ephemeral X25519 agreement yields a master secret, the
//! IV is an HMAC of the plaintext, and the cipher key is bound to that IV.
//! Decryption recomputes the IV and rejects any mismatch.
//!
//! # Provisioning
//!
//! A device being linked publishes an ephemeral X25519 public key. The
//! primary device seals the provisioning message to that key
//! (X25519 → HKDF → XChaCha20-Poly1305); [`ProvisioningCipher`] opens it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod device_name;
mod error;
mod identity;
mod keys;
mod profile;
mod provisioning;

pub use device_name::{EncryptedDeviceName, decrypt_device_name, encrypt_device_name};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, IdentityPublicKey, SIGNATURE_SIZE};
pub use keys::{KEY_SIZE, KeyPair, PublicKey, SignedPreKey, generate_signed_pre_key};
pub use profile::{ACCESS_KEY_SIZE, ProfileKey, derive_access_key};
pub use provisioning::{
    PROVISIONING_NONCE_SIZE, ProvisionEnvelope, ProvisioningCipher, seal_provisioning_message,
};
