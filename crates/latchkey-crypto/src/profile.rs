//! Profile keys and the unidentified-access key derived from them.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::KEY_SIZE;

/// Size of a derived access key in bytes.
pub const ACCESS_KEY_SIZE: usize = 16;

const ACCESS_KEY_LABEL: &[u8] = b"latchkeyAccessKeyV1";

/// Symmetric key protecting a contact's profile.
///
/// Carried on contact records and transplanted when two records merge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey([u8; KEY_SIZE]);

impl ProfileKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProfileKey(..)")
    }
}

/// Derive the access key uploaded alongside registration.
#[must_use]
pub fn derive_access_key(profile_key: &ProfileKey) -> [u8; ACCESS_KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, profile_key.as_bytes());
    let mut out = [0u8; ACCESS_KEY_SIZE];
    let Ok(()) = hkdf.expand(ACCESS_KEY_LABEL, &mut out) else {
        unreachable!("16 bytes is a valid HKDF-SHA256 output length");
    };
    out
}
