//! Records persisted by the record store.
//!
//! Identifier newtypes normalise on construction so that comparisons are
//! plain equality: stable ids are lowercased, empty identifiers are rejected.

use std::fmt;

use latchkey_crypto::{IdentityKeyPair, KeyPair, ProfileKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::env::Environment;

/// Current contact record schema version.
pub const CONTACT_SCHEMA_VERSION: u32 = 2;

/// Errors constructing identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Identifier was empty or whitespace
    #[error("empty {field}")]
    Empty {
        /// Which identifier was empty
        field: &'static str,
    },
}

/// Process-local contact id.
///
/// Generated once per record from the environment RNG and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(Uuid);

impl ContactId {
    /// Generate a fresh random id.
    pub fn generate(env: &impl Environment) -> Self {
        let mut bytes = [0u8; 16];
        env.random_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse the hyphenated form. `None` if the input is not a UUID.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input).ok().map(Self)
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Big-endian bytes, used as the durable key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl fmt::Debug for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactId({})", self.0.hyphenated())
    }
}

/// Server-assigned stable identifier (a UUID string), lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StableId(String);

impl StableId {
    /// Normalise and validate a stable id.
    ///
    /// # Errors
    ///
    /// - `ModelError::Empty` if the input is empty after trimming
    pub fn new(input: &str) -> Result<Self, ModelError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ModelError::Empty { field: "stable id" });
        }
        Ok(Self(trimmed.to_lowercase()))
    }

    /// Normalised string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the input has the shape of a stable id.
    #[must_use]
    pub fn looks_like(input: &str) -> bool {
        Uuid::parse_str(input.trim()).is_ok()
    }
}

impl TryFrom<String> for StableId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<StableId> for String {
    fn from(value: StableId) -> Self {
        value.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phone number in E.164 form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Validate a phone number.
    ///
    /// # Errors
    ///
    /// - `ModelError::Empty` if the input is empty after trimming
    pub fn new(input: &str) -> Result<Self, ModelError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ModelError::Empty { field: "phone number" });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// String form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Validate a group id.
    ///
    /// # Errors
    ///
    /// - `ModelError::Empty` if the input is empty
    pub fn new(input: &str) -> Result<Self, ModelError> {
        if input.trim().is_empty() {
            return Err(ModelError::Empty { field: "group id" });
        }
        Ok(Self(input.trim().to_string()))
    }

    /// String form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GroupId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<GroupId> for String {
    fn from(value: GroupId) -> Self {
        value.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a contact is a person or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactKind {
    /// One remote account
    Individual,
    /// A group conversation
    Group,
}

/// One canonical contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Process-local id
    pub id: ContactId,
    /// Server stable identifier, if known
    pub stable_id: Option<StableId>,
    /// Phone number, if known
    pub phone_number: Option<PhoneNumber>,
    /// Individual or group
    pub kind: ContactKind,
    /// Present iff `kind` is `Group`
    pub group_id: Option<GroupId>,
    /// Group membership (groups only)
    pub members: Vec<ContactId>,
    /// Profile key learned from the contact
    pub profile_key: Option<ProfileKey>,
    /// Last activity in milliseconds since the epoch
    pub active_at: Option<u64>,
    /// Record schema version
    pub schema_version: u32,
}

impl ContactRecord {
    /// Empty individual record.
    #[must_use]
    pub fn individual(id: ContactId) -> Self {
        Self {
            id,
            stable_id: None,
            phone_number: None,
            kind: ContactKind::Individual,
            group_id: None,
            members: Vec::new(),
            profile_key: None,
            active_at: None,
            schema_version: CONTACT_SCHEMA_VERSION,
        }
    }

    /// Group record with no members.
    #[must_use]
    pub fn group(id: ContactId, group_id: GroupId) -> Self {
        Self { kind: ContactKind::Group, group_id: Some(group_id), ..Self::individual(id) }
    }

    /// Whether the record may be persisted.
    ///
    /// Groups need a group id; individuals need a stable id or a phone number
    /// and must not carry a group id.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self.kind {
            ContactKind::Group => self.group_id.is_some(),
            ContactKind::Individual => {
                self.group_id.is_none() && (self.stable_id.is_some() || self.phone_number.is_some())
            },
        }
    }

    /// Whether this record is a group.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.kind == ContactKind::Group
    }
}

/// Opaque session blob for one device of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning contact
    pub contact_id: ContactId,
    /// Remote device id
    pub device_id: u32,
    /// Serialized session state
    pub data: Vec<u8>,
}

/// Verification state of a remote identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifiedStatus {
    /// Never checked
    #[default]
    Default,
    /// Safety number confirmed by the user
    Verified,
    /// Previously verified, since changed
    Unverified,
}

/// Remote identity key as last seen for a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Owning contact
    pub contact_id: ContactId,
    /// Encoded public identity key
    pub public_key: Vec<u8>,
    /// Trusted on first use
    pub first_use: bool,
    /// When the key was saved, milliseconds since the epoch
    pub timestamp_ms: u64,
    /// Verification state
    pub verified: VerifiedStatus,
    /// Approved without blocking sends
    pub nonblocking_approval: bool,
}

/// Message owned by a conversation. Only ownership matters here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message id
    pub id: u64,
    /// Owning conversation
    pub conversation_id: ContactId,
    /// Send time, milliseconds since the epoch
    pub sent_at: u64,
    /// Message body
    pub body: String,
}

/// One-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Device-scoped key id
    pub key_id: u32,
    /// X25519 key pair
    pub key_pair: KeyPair,
}

/// Signed prekey and its lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Device-scoped key id
    pub key_id: u32,
    /// X25519 key pair
    pub key_pair: KeyPair,
    /// Identity signature over the public key
    pub signature: Vec<u8>,
    /// Creation time, milliseconds since the epoch
    pub created_at_ms: u64,
    /// Accepted by the server
    pub confirmed: bool,
}

fn first_key_id() -> u32 {
    1
}

/// Registration state of this installation.
///
/// `number` and `stable_id` double as the previous identity markers: a
/// registration that changes either wipes all protocol data first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Registered phone number
    pub number: Option<PhoneNumber>,
    /// Server-assigned stable id
    pub stable_id: Option<StableId>,
    /// Device id within the account (1 = primary)
    pub device_id: Option<u32>,
    /// Server password
    pub password: Option<String>,
    /// Local registration id
    pub registration_id: Option<u32>,
    /// Identity key pair
    pub identity_key: Option<IdentityKeyPair>,
    /// Own profile key
    pub profile_key: Option<ProfileKey>,
    /// Plaintext device name
    pub device_name: Option<String>,
    /// Whether the server holds the encrypted device name
    pub device_name_encrypted: bool,
    /// User agent of the provisioning device
    pub user_agent: Option<String>,
    /// Read receipt setting
    pub read_receipts: bool,
    /// Legacy signaling key
    pub signaling_key: Option<Vec<u8>>,
    /// Next one-time prekey id
    #[serde(default = "first_key_id")]
    pub next_pre_key_id: u32,
    /// Next signed prekey id
    #[serde(default = "first_key_id")]
    pub next_signed_pre_key_id: u32,
    /// Consecutive signed prekey rejections
    #[serde(default)]
    pub signed_key_rotation_rejected: u32,
    /// Registration completed
    #[serde(default)]
    pub registration_done: bool,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            number: None,
            stable_id: None,
            device_id: None,
            password: None,
            registration_id: None,
            identity_key: None,
            profile_key: None,
            device_name: None,
            device_name_encrypted: false,
            user_agent: None,
            read_receipts: false,
            signaling_key: None,
            next_pre_key_id: first_key_id(),
            next_signed_pre_key_id: first_key_id(),
            signed_key_rotation_rejected: 0,
            registration_done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_case_insensitive() {
        let upper = StableId::new("2F3A9C1E-0000-4000-8000-00000000ABCD").unwrap();
        let lower = StableId::new("2f3a9c1e-0000-4000-8000-00000000abcd").unwrap();

        assert_eq!(upper, lower);
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert_eq!(StableId::new("  "), Err(ModelError::Empty { field: "stable id" }));
        assert_eq!(PhoneNumber::new(""), Err(ModelError::Empty { field: "phone number" }));
        assert_eq!(GroupId::new(""), Err(ModelError::Empty { field: "group id" }));
    }

    #[test]
    fn stable_id_shape() {
        assert!(StableId::looks_like("2f3a9c1e-0000-4000-8000-00000000abcd"));
        assert!(!StableId::looks_like("+15551234567"));
    }

    #[test]
    fn validity_rules() {
        let id = ContactId::from_uuid(Uuid::nil());
        let mut individual = ContactRecord::individual(id);
        assert!(!individual.is_valid());

        individual.phone_number = Some(PhoneNumber::new("+15551234567").unwrap());
        assert!(individual.is_valid());

        let group = ContactRecord::group(id, GroupId::new("g1").unwrap());
        assert!(group.is_valid());
        assert!(group.is_group());
    }

    #[test]
    fn account_state_counters_start_at_one() {
        let state = AccountState::default();
        assert_eq!(state.next_pre_key_id, 1);
        assert_eq!(state.next_signed_pre_key_id, 1);
    }

    #[test]
    fn stable_id_deserialization_normalises() {
        let mut bytes = Vec::new();
        ciborium::into_writer(&"ABC-DEF".to_string(), &mut bytes).unwrap();
        let decoded: StableId = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(decoded.as_str(), "abc-def");
    }
}
