//! Server account API.
//!
//! The coordinator never speaks HTTP itself. Everything it needs from the
//! account service goes through [`AccountApi`], so production wires in a real
//! client and tests wire in a scripted one.

use std::future::Future;

use latchkey_core::model::{PhoneNumber, StableId};
use latchkey_crypto::{IdentityPublicKey, PublicKey};
use thiserror::Error;

/// Errors reported by the account service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Server answered with a non-success status
    #[error("server returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Reason text from the server
        message: String,
    },

    /// Request never got a response
    #[error("network error: {0}")]
    Network(String),
}

impl ApiError {
    /// Whether the server looked at the request and refused it.
    ///
    /// Any 4xx or 5xx answer counts; signed prekey rotation counts these
    /// instead of failing.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Http { status, .. } if (400..=599).contains(status))
    }

    /// HTTP status, if the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Network(_) => None,
        }
    }

    /// Returns true if retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || (500..=599).contains(status),
        }
    }
}

/// How the verification code should reach the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTransport {
    /// Text message
    Sms,
    /// Voice call
    Voice,
}

/// Account confirmation sent with the verification or provisioning code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmCodeRequest {
    /// Number being registered
    pub number: PhoneNumber,
    /// Verification code (single device) or provisioning code (linked device)
    pub code: String,
    /// Freshly generated server password
    pub password: String,
    /// Local registration id
    pub registration_id: u32,
    /// Encrypted device name, linked devices only
    pub encrypted_device_name: Option<Vec<u8>>,
    /// Unidentified delivery access key derived from the profile key
    pub access_key: Option<[u8; 16]>,
}

/// Server answer to a successful confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmCodeResponse {
    /// Stable id assigned to the account, if the server issues one
    pub stable_id: Option<StableId>,
    /// Device id; absent means the primary device (1)
    pub device_id: Option<u32>,
}

/// One-time prekey as uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyUpload {
    /// Key id
    pub key_id: u32,
    /// Public half
    pub public_key: PublicKey,
}

/// Signed prekey as uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyUpload {
    /// Key id
    pub key_id: u32,
    /// Public half
    pub public_key: PublicKey,
    /// Identity signature over the public half
    pub signature: Vec<u8>,
}

/// Full key bundle registered after account creation or prekey refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpload {
    /// Public identity key
    pub identity_key: IdentityPublicKey,
    /// Current signed prekey
    pub signed_pre_key: SignedPreKeyUpload,
    /// Batch of one-time prekeys
    pub pre_keys: Vec<PreKeyUpload>,
}

/// Account service used by registration and key maintenance.
pub trait AccountApi: Clone + Send + Sync + 'static {
    /// Confirm the account with a verification or provisioning code.
    fn confirm_code(
        &self,
        request: &ConfirmCodeRequest,
    ) -> impl Future<Output = Result<ConfirmCodeResponse, ApiError>> + Send;

    /// Upload the identity key, a signed prekey and one-time prekeys.
    fn register_keys(&self, keys: &KeyUpload) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Number of one-time prekeys the server still holds for this device.
    fn get_my_keys(&self) -> impl Future<Output = Result<usize, ApiError>> + Send;

    /// Replace the signed prekey.
    fn set_signed_pre_key(
        &self,
        key: &SignedPreKeyUpload,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Drop the legacy signaling key from the server.
    fn remove_signaling_key(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Store the encrypted device name.
    fn update_device_name(
        &self,
        encrypted_name: &[u8],
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Ask the server to send a verification code.
    fn request_verification(
        &self,
        number: &PhoneNumber,
        transport: VerificationTransport,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}
