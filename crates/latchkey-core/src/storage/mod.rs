//! Record store abstraction.
//!
//! Durable storage for contacts, message ownership, sessions, remote
//! identities, prekeys, signed prekeys and the account state. All operations
//! are atomic at the single-record level; there are no multi-record
//! transactions, so callers that touch several records (contact merges,
//! identity-change wipes) perform sequential writes.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::future::Future;

pub use chaotic::{ChaoticStore, StoreOp};
pub use error::StoreError;
pub use memory::MemoryStore;

pub use self::redb::RedbStore;
use crate::model::{
    AccountState, ContactId, ContactRecord, IdentityRecord, MessageRecord, PreKeyRecord,
    SessionRecord, SignedPreKeyRecord,
};

/// Storage abstraction for account and contact records.
///
/// Must be Clone (shared by the resolver, the key manager and background
/// merges) and Send + Sync. Implementations share internal state via Arc, so
/// clones access the same underlying storage.
///
/// Every method returns a `Send` future so that callers can run store work
/// inside spawned tasks.
pub trait RecordStore: Clone + Send + Sync + 'static {
    /// All contact records, in no particular order.
    fn load_contacts(&self) -> impl Future<Output = Result<Vec<ContactRecord>, StoreError>> + Send;

    /// Insert or overwrite a contact record.
    fn save_contact(
        &self,
        contact: &ContactRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a contact record. Missing ids are not an error.
    fn remove_contact(&self, id: ContactId) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Group records whose membership includes `member`.
    fn groups_with_member(
        &self,
        member: ContactId,
    ) -> impl Future<Output = Result<Vec<ContactRecord>, StoreError>> + Send;

    /// Insert or overwrite a message.
    fn save_message(
        &self,
        message: &MessageRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Messages owned by a conversation, ordered by `sent_at`.
    fn messages_for(
        &self,
        conversation: ContactId,
    ) -> impl Future<Output = Result<Vec<MessageRecord>, StoreError>> + Send;

    /// Move ownership of every message from `from` to `to`.
    ///
    /// Returns the number of messages moved.
    fn migrate_messages(
        &self,
        from: ContactId,
        to: ContactId,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Insert or overwrite a session.
    fn store_session(
        &self,
        session: &SessionRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Device ids with a session for `contact`, ascending.
    fn device_ids(
        &self,
        contact: ContactId,
    ) -> impl Future<Output = Result<Vec<u32>, StoreError>> + Send;

    /// Delete one session. Missing sessions are not an error.
    fn remove_session(
        &self,
        contact: ContactId,
        device_id: u32,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every session.
    fn clear_sessions(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert or overwrite a remote identity.
    fn save_identity(
        &self,
        identity: &IdentityRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remote identity of a contact. `None` if never seen.
    fn load_identity(
        &self,
        contact: ContactId,
    ) -> impl Future<Output = Result<Option<IdentityRecord>, StoreError>> + Send;

    /// Delete a remote identity. Missing records are not an error.
    fn remove_identity(
        &self,
        contact: ContactId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert or overwrite a one-time prekey.
    fn store_pre_key(
        &self,
        pre_key: &PreKeyRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// One-time prekey by id.
    fn load_pre_key(
        &self,
        key_id: u32,
    ) -> impl Future<Output = Result<Option<PreKeyRecord>, StoreError>> + Send;

    /// Delete a one-time prekey.
    fn remove_pre_key(&self, key_id: u32) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every one-time prekey.
    fn clear_pre_keys(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Number of stored one-time prekeys.
    fn pre_key_count(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Insert or overwrite a signed prekey.
    fn store_signed_pre_key(
        &self,
        signed_pre_key: &SignedPreKeyRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Signed prekey by id.
    fn load_signed_pre_key(
        &self,
        key_id: u32,
    ) -> impl Future<Output = Result<Option<SignedPreKeyRecord>, StoreError>> + Send;

    /// Every signed prekey, ascending by key id.
    fn load_signed_pre_keys(
        &self,
    ) -> impl Future<Output = Result<Vec<SignedPreKeyRecord>, StoreError>> + Send;

    /// Delete a signed prekey.
    fn remove_signed_pre_key(
        &self,
        key_id: u32,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every signed prekey.
    fn clear_signed_pre_keys(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Account state. Defaults when nothing was stored yet.
    fn load_account(&self) -> impl Future<Output = Result<AccountState, StoreError>> + Send;

    /// Overwrite the account state.
    fn store_account(
        &self,
        account: &AccountState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete sessions, remote identities, prekeys and signed prekeys.
    ///
    /// Contacts, messages and the account state are untouched. Used when a
    /// re-registration changes the number or stable id.
    fn remove_all_protocol_data(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
