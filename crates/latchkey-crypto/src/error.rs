//! Error types for key primitives.

use thiserror::Error;

/// Errors produced by the cryptographic primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes do not decode to a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the identity key
    #[error("invalid signature")]
    InvalidSignature,

    /// Input shorter than the fixed-size prefix it must carry
    #[error("truncated input: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes received
        actual: usize,
    },

    /// Envelope version byte is not one we understand
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Authentication failed (wrong key or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Which check failed
        reason: String,
    },

    /// Decrypted device name is not valid UTF-8
    #[error("decrypted device name is not valid UTF-8")]
    InvalidUtf8,
}
