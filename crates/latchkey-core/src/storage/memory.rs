#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{RecordStore, StoreError};
use crate::model::{
    AccountState, ContactId, ContactRecord, IdentityRecord, MessageRecord, PreKeyRecord,
    SessionRecord, SignedPreKeyRecord,
};

/// In-memory record store for testing and simulation
///
/// All state is wrapped in Arc<Mutex<>> so clones share it. The lock is never
/// held across an await point. Uses `lock().expect()` which will panic if the
/// mutex is poisoned - acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    contacts: HashMap<ContactId, ContactRecord>,
    messages: HashMap<u64, MessageRecord>,
    /// Keyed by (contact, device) so device ids come out sorted
    sessions: BTreeMap<(ContactId, u32), SessionRecord>,
    identities: HashMap<ContactId, IdentityRecord>,
    pre_keys: BTreeMap<u32, PreKeyRecord>,
    signed_pre_keys: BTreeMap<u32, SignedPreKeyRecord>,
    account: Option<AccountState>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contacts.
    pub fn contact_count(&self) -> usize {
        self.lock().contacts.len()
    }

    /// Number of stored sessions across all contacts.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of stored remote identities.
    pub fn identity_count(&self) -> usize {
        self.lock().identities.len()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("Mutex poisoned")
    }
}

impl RecordStore for MemoryStore {
    async fn load_contacts(&self) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self.lock().contacts.values().cloned().collect())
    }

    async fn save_contact(&self, contact: &ContactRecord) -> Result<(), StoreError> {
        self.lock().contacts.insert(contact.id, contact.clone());
        Ok(())
    }

    async fn remove_contact(&self, id: ContactId) -> Result<(), StoreError> {
        self.lock().contacts.remove(&id);
        Ok(())
    }

    async fn groups_with_member(&self, member: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .contacts
            .values()
            .filter(|c| c.is_group() && c.members.contains(&member))
            .cloned()
            .collect())
    }

    async fn save_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        self.lock().messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn messages_for(&self, conversation: ContactId) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();
        let mut messages: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        Ok(messages)
    }

    async fn migrate_messages(&self, from: ContactId, to: ContactId) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let mut moved = 0;
        for message in inner.messages.values_mut().filter(|m| m.conversation_id == from) {
            message.conversation_id = to;
            moved += 1;
        }
        Ok(moved)
    }

    async fn store_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.lock().sessions.insert((session.contact_id, session.device_id), session.clone());
        Ok(())
    }

    async fn device_ids(&self, contact: ContactId) -> Result<Vec<u32>, StoreError> {
        let inner = self.lock();
        Ok(inner.sessions.keys().filter(|(c, _)| *c == contact).map(|(_, d)| *d).collect())
    }

    async fn remove_session(&self, contact: ContactId, device_id: u32) -> Result<(), StoreError> {
        self.lock().sessions.remove(&(contact, device_id));
        Ok(())
    }

    async fn clear_sessions(&self) -> Result<(), StoreError> {
        self.lock().sessions.clear();
        Ok(())
    }

    async fn save_identity(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        self.lock().identities.insert(identity.contact_id, identity.clone());
        Ok(())
    }

    async fn load_identity(&self, contact: ContactId) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.lock().identities.get(&contact).cloned())
    }

    async fn remove_identity(&self, contact: ContactId) -> Result<(), StoreError> {
        self.lock().identities.remove(&contact);
        Ok(())
    }

    async fn store_pre_key(&self, pre_key: &PreKeyRecord) -> Result<(), StoreError> {
        self.lock().pre_keys.insert(pre_key.key_id, pre_key.clone());
        Ok(())
    }

    async fn load_pre_key(&self, key_id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        Ok(self.lock().pre_keys.get(&key_id).cloned())
    }

    async fn remove_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.lock().pre_keys.remove(&key_id);
        Ok(())
    }

    async fn clear_pre_keys(&self) -> Result<(), StoreError> {
        self.lock().pre_keys.clear();
        Ok(())
    }

    async fn pre_key_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock().pre_keys.len())
    }

    async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.lock().signed_pre_keys.insert(signed_pre_key.key_id, signed_pre_key.clone());
        Ok(())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        Ok(self.lock().signed_pre_keys.get(&key_id).cloned())
    }

    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        Ok(self.lock().signed_pre_keys.values().cloned().collect())
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.lock().signed_pre_keys.remove(&key_id);
        Ok(())
    }

    async fn clear_signed_pre_keys(&self) -> Result<(), StoreError> {
        self.lock().signed_pre_keys.clear();
        Ok(())
    }

    async fn load_account(&self) -> Result<AccountState, StoreError> {
        Ok(self.lock().account.clone().unwrap_or_default())
    }

    async fn store_account(&self, account: &AccountState) -> Result<(), StoreError> {
        self.lock().account = Some(account.clone());
        Ok(())
    }

    async fn remove_all_protocol_data(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sessions.clear();
        inner.identities.clear();
        inner.pre_keys.clear();
        inner.signed_pre_keys.clear();
        Ok(())
    }
}
