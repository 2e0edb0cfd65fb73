//! Client error types.
//!
//! One enum per component. Lower-layer errors convert with `?`; each enum
//! says whether a retry has a chance via `is_transient`.

use latchkey_core::{SerializerError, StoreError, model::ContactId, model::ModelError};
use latchkey_crypto::CryptoError;
use thiserror::Error;

use crate::{api::ApiError, registration::RegistrationState};

/// Errors from contact resolution and merging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// Contact index used before `load` completed
    #[error("contact index is not loaded")]
    NotLoaded,

    /// `load` called a second time
    #[error("contact index already loaded")]
    AlreadyLoaded,

    /// Identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] ModelError),

    /// No contact with this id in the index
    #[error("unknown contact {0}")]
    UnknownContact(ContactId),

    /// Asked to merge a contact into itself
    #[error("cannot merge contact {0} into itself")]
    SelfMerge(ContactId),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Merge queue gave up on the task
    #[error("merge queue: {0}")]
    Serializer(#[from] SerializerError),
}

impl ResolverError {
    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Serializer(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors from prekey generation, rotation and pruning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// No identity key stored yet
    #[error("no identity key available")]
    MissingIdentityKey,

    /// Signed prekey to confirm was never stored
    #[error("unknown signed prekey {0}")]
    UnknownSignedPreKey(u32),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Account service failed (other than a counted rejection)
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

impl KeyError {
    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Api(e) => e.is_transient(),
            Self::MissingIdentityKey | Self::UnknownSignedPreKey(_) => false,
        }
    }
}

/// Errors from account registration and device linking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// State machine refused a step
    #[error("invalid registration transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State before the step
        from: RegistrationState,
        /// Requested state
        to: RegistrationState,
    },

    /// Provisioning channel closed before an envelope arrived
    #[error("provisioning channel closed before a provision message arrived")]
    ProvisioningClosed,

    /// Provisioning request body could not be decoded
    #[error("malformed provisioning payload: {0}")]
    MalformedProvisioning(String),

    /// User declined to name the device
    #[error("device linking cancelled")]
    Cancelled,

    /// Device name was empty
    #[error("invalid device name")]
    InvalidDeviceName,

    /// Provision message lacked required key data
    #[error("provision message is missing {missing}")]
    IncompleteProvisionMessage {
        /// The absent field
        missing: &'static str,
    },

    /// Self contact could not be resolved after registration
    #[error("registration finished without a self contact")]
    NoSelfContact,

    /// Identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] ModelError),

    /// Account service failed
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Key management failed
    #[error("key error: {0}")]
    Keys(#[from] KeyError),

    /// Contact resolution failed
    #[error("contact error: {0}")]
    Contacts(#[from] ResolverError),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Account queue gave up on the task
    #[error("account queue: {0}")]
    Serializer(#[from] SerializerError),
}

impl RegistrationError {
    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProvisioningClosed => true,
            Self::Api(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::Keys(e) => e.is_transient(),
            Self::Contacts(e) => e.is_transient(),
            Self::Serializer(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_the_source() {
        let io = StoreError::Io("disk full".into());
        assert!(ResolverError::Store(io.clone()).is_transient());
        assert!(RegistrationError::Keys(KeyError::Store(io)).is_transient());

        assert!(!ResolverError::NotLoaded.is_transient());
        assert!(!KeyError::MissingIdentityKey.is_transient());
        assert!(!RegistrationError::InvalidDeviceName.is_transient());
    }

    #[test]
    fn rejection_is_not_transient() {
        let rejected = ApiError::Http { status: 403, message: "forbidden".into() };
        assert!(!KeyError::Api(rejected).is_transient());
    }
}
