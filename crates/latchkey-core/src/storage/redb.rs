//! Redb-backed durable record store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait operation is one transaction, matching the single-record atomicity
//! the services assume. Values are CBOR-encoded with ciborium.
//!
//! Redb calls are blocking; records are small and the store is local, so they
//! run inline on the calling task.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{RecordStore, StoreError};
use crate::model::{
    AccountState, ContactId, ContactRecord, IdentityRecord, MessageRecord, PreKeyRecord,
    SessionRecord, SignedPreKeyRecord,
};

type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Table: contacts
/// Key: contact id [16 bytes]
/// Value: CBOR-encoded ContactRecord
const CONTACTS: BytesTable = TableDefinition::new("contacts");

/// Table: messages
/// Key: message id as big-endian bytes [8 bytes]
/// Value: CBOR-encoded MessageRecord
const MESSAGES: BytesTable = TableDefinition::new("messages");

/// Table: sessions
/// Key: (contact id [16 bytes], device id [4 bytes BE])
/// Value: CBOR-encoded SessionRecord
const SESSIONS: BytesTable = TableDefinition::new("sessions");

/// Table: identities
/// Key: contact id [16 bytes]
/// Value: CBOR-encoded IdentityRecord
const IDENTITIES: BytesTable = TableDefinition::new("identities");

/// Table: pre_keys
/// Key: key id as big-endian bytes [4 bytes]
/// Value: CBOR-encoded PreKeyRecord
const PRE_KEYS: BytesTable = TableDefinition::new("pre_keys");

/// Table: signed_pre_keys
/// Key: key id as big-endian bytes [4 bytes]
/// Value: CBOR-encoded SignedPreKeyRecord
const SIGNED_PRE_KEYS: BytesTable = TableDefinition::new("signed_pre_keys");

/// Table: account
/// Key: `ACCOUNT_KEY`
/// Value: CBOR-encoded AccountState
const ACCOUNT: BytesTable = TableDefinition::new("account");

const ACCOUNT_KEY: &[u8] = b"state";

const ALL_TABLES: [BytesTable; 7] =
    [CONTACTS, MESSAGES, SESSIONS, IDENTITIES, PRE_KEYS, SIGNED_PRE_KEYS, ACCOUNT];

/// Durable record store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        for table in ALL_TABLES {
            let _ = txn.open_table(table).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get(&self, def: BytesTable, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(def).map_err(io)?;
        let value = table.get(key).map_err(io)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan(&self, def: BytesTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(def).map_err(io)?;

        let mut entries = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn count(&self, def: BytesTable) -> Result<usize, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(def).map_err(io)?;
        Ok(table.len().map_err(io)? as usize)
    }

    /// Run `f` inside one write transaction on `def` and commit.
    fn write<T>(
        &self,
        def: BytesTable,
        f: impl FnOnce(&mut Table<'_, &'static [u8], &'static [u8]>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;
        let out = {
            let mut table = txn.open_table(def).map_err(io)?;
            f(&mut table)?
        };
        txn.commit().map_err(io)?;
        Ok(out)
    }

    fn put(&self, def: BytesTable, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(def, |table| {
            table.insert(key, value).map_err(io)?;
            Ok(())
        })
    }

    fn delete(&self, def: BytesTable, key: &[u8]) -> Result<(), StoreError> {
        self.write(def, |table| {
            table.remove(key).map_err(io)?;
            Ok(())
        })
    }

    fn clear(&self, def: BytesTable) -> Result<(), StoreError> {
        self.write(def, |table| {
            let keys = table_keys(table)?;
            for key in keys {
                table.remove(key.as_slice()).map_err(io)?;
            }
            Ok(())
        })
    }
}

impl RecordStore for RedbStore {
    async fn load_contacts(&self) -> Result<Vec<ContactRecord>, StoreError> {
        self.scan(CONTACTS)?.iter().map(|(_, value)| decode(value)).collect()
    }

    async fn save_contact(&self, contact: &ContactRecord) -> Result<(), StoreError> {
        self.put(CONTACTS, &contact.id.to_bytes(), &encode(contact)?)
    }

    async fn remove_contact(&self, id: ContactId) -> Result<(), StoreError> {
        self.delete(CONTACTS, &id.to_bytes())
    }

    async fn groups_with_member(&self, member: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        let mut groups = Vec::new();
        for (_, value) in self.scan(CONTACTS)? {
            let contact: ContactRecord = decode(&value)?;
            if contact.is_group() && contact.members.contains(&member) {
                groups.push(contact);
            }
        }
        Ok(groups)
    }

    async fn save_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        self.put(MESSAGES, &message.id.to_be_bytes(), &encode(message)?)
    }

    async fn messages_for(&self, conversation: ContactId) -> Result<Vec<MessageRecord>, StoreError> {
        let mut messages = Vec::new();
        for (_, value) in self.scan(MESSAGES)? {
            let message: MessageRecord = decode(&value)?;
            if message.conversation_id == conversation {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| (m.sent_at, m.id));
        Ok(messages)
    }

    async fn migrate_messages(&self, from: ContactId, to: ContactId) -> Result<usize, StoreError> {
        self.write(MESSAGES, |table| {
            let mut owned = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let message: MessageRecord = decode(value.value())?;
                if message.conversation_id == from {
                    owned.push((key.value().to_vec(), message));
                }
            }

            let moved = owned.len();
            for (key, mut message) in owned {
                message.conversation_id = to;
                table.insert(key.as_slice(), encode(&message)?.as_slice()).map_err(io)?;
            }
            Ok(moved)
        })
    }

    async fn store_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let key = encode_session_key(session.contact_id, session.device_id);
        self.put(SESSIONS, &key, &encode(session)?)
    }

    async fn device_ids(&self, contact: ContactId) -> Result<Vec<u32>, StoreError> {
        let start = encode_session_key(contact, 0);
        let end = encode_session_key(contact, u32::MAX);

        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SESSIONS).map_err(io)?;

        let mut devices = Vec::new();
        for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            devices.push(decode_session_key(key.value())?.1);
        }
        Ok(devices)
    }

    async fn remove_session(&self, contact: ContactId, device_id: u32) -> Result<(), StoreError> {
        self.delete(SESSIONS, &encode_session_key(contact, device_id))
    }

    async fn clear_sessions(&self) -> Result<(), StoreError> {
        self.clear(SESSIONS)
    }

    async fn save_identity(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        self.put(IDENTITIES, &identity.contact_id.to_bytes(), &encode(identity)?)
    }

    async fn load_identity(&self, contact: ContactId) -> Result<Option<IdentityRecord>, StoreError> {
        self.get(IDENTITIES, &contact.to_bytes())?.map(|bytes| decode(&bytes)).transpose()
    }

    async fn remove_identity(&self, contact: ContactId) -> Result<(), StoreError> {
        self.delete(IDENTITIES, &contact.to_bytes())
    }

    async fn store_pre_key(&self, pre_key: &PreKeyRecord) -> Result<(), StoreError> {
        self.put(PRE_KEYS, &pre_key.key_id.to_be_bytes(), &encode(pre_key)?)
    }

    async fn load_pre_key(&self, key_id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        self.get(PRE_KEYS, &key_id.to_be_bytes())?.map(|bytes| decode(&bytes)).transpose()
    }

    async fn remove_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.delete(PRE_KEYS, &key_id.to_be_bytes())
    }

    async fn clear_pre_keys(&self) -> Result<(), StoreError> {
        self.clear(PRE_KEYS)
    }

    async fn pre_key_count(&self) -> Result<usize, StoreError> {
        self.count(PRE_KEYS)
    }

    async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), StoreError> {
        let key = signed_pre_key.key_id.to_be_bytes();
        self.put(SIGNED_PRE_KEYS, &key, &encode(signed_pre_key)?)
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.get(SIGNED_PRE_KEYS, &key_id.to_be_bytes())?.map(|bytes| decode(&bytes)).transpose()
    }

    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        // Big-endian keys iterate in ascending id order
        self.scan(SIGNED_PRE_KEYS)?.iter().map(|(_, value)| decode(value)).collect()
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.delete(SIGNED_PRE_KEYS, &key_id.to_be_bytes())
    }

    async fn clear_signed_pre_keys(&self) -> Result<(), StoreError> {
        self.clear(SIGNED_PRE_KEYS)
    }

    async fn load_account(&self) -> Result<AccountState, StoreError> {
        match self.get(ACCOUNT, ACCOUNT_KEY)? {
            Some(bytes) => decode(&bytes),
            None => Ok(AccountState::default()),
        }
    }

    async fn store_account(&self, account: &AccountState) -> Result<(), StoreError> {
        self.put(ACCOUNT, ACCOUNT_KEY, &encode(account)?)
    }

    async fn remove_all_protocol_data(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;
        for def in [SESSIONS, IDENTITIES, PRE_KEYS, SIGNED_PRE_KEYS] {
            let mut table = txn.open_table(def).map_err(io)?;
            for key in table_keys(&table)? {
                table.remove(key.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;
        Ok(())
    }
}

fn io(err: impl std::fmt::Display) -> StoreError {
    StoreError::Io(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn table_keys(table: &Table<'_, &'static [u8], &'static [u8]>) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut keys = Vec::new();
    for entry in table.iter().map_err(io)? {
        let (key, _) = entry.map_err(io)?;
        keys.push(key.value().to_vec());
    }
    Ok(keys)
}

/// Encode (contact id, device id) as a 20-byte key.
///
/// Layout: [contact id: 16 bytes][device id: 4 bytes BE]
/// All devices of one contact form a contiguous ascending range.
fn encode_session_key(contact: ContactId, device_id: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(&contact.to_bytes());
    key[16..].copy_from_slice(&device_id.to_be_bytes());
    key
}

fn decode_session_key(key: &[u8]) -> Result<([u8; 16], u32), StoreError> {
    if key.len() != 20 {
        return Err(StoreError::Corrupt {
            table: "sessions",
            reason: format!("key is {} bytes, expected 20", key.len()),
        });
    }

    let mut contact = [0u8; 16];
    contact.copy_from_slice(&key[..16]);
    let mut device = [0u8; 4];
    device.copy_from_slice(&key[16..]);
    Ok((contact, u32::from_be_bytes(device)))
}

#[cfg(test)]
mod tests {
    use latchkey_crypto::KeyPair;
    use tempfile::tempdir;
    use uuid::Uuid;

    use super::*;
    use crate::model::PhoneNumber;

    fn contact(n: u128, phone: &str) -> ContactRecord {
        let mut record = ContactRecord::individual(ContactId::from_uuid(Uuid::from_u128(n)));
        record.phone_number = Some(PhoneNumber::new(phone).unwrap());
        record
    }

    #[test]
    fn session_key_encoding() {
        let contact = ContactId::from_uuid(Uuid::from_u128(0x1234));
        let key = encode_session_key(contact, 7);

        let (decoded_contact, device) = decode_session_key(&key).unwrap();
        assert_eq!(decoded_contact, contact.to_bytes());
        assert_eq!(device, 7);
    }

    #[test]
    fn short_session_key_is_corrupt() {
        assert!(matches!(decode_session_key(&[0u8; 5]), Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn contacts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.save_contact(&contact(1, "+15550001")).await.unwrap();
            store.save_contact(&contact(2, "+15550002")).await.unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let mut loaded = store.load_contacts().await.unwrap();
        loaded.sort_by_key(|c| c.id);

        assert_eq!(loaded, vec![contact(1, "+15550001"), contact(2, "+15550002")]);
    }

    #[tokio::test]
    async fn device_ids_are_scoped_to_contact() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("records.redb")).unwrap();
        let a = ContactId::from_uuid(Uuid::from_u128(1));
        let b = ContactId::from_uuid(Uuid::from_u128(2));

        for (contact_id, device_id) in [(a, 3), (a, 1), (b, 2)] {
            let session = SessionRecord { contact_id, device_id, data: vec![device_id as u8] };
            store.store_session(&session).await.unwrap();
        }

        assert_eq!(store.device_ids(a).await.unwrap(), vec![1, 3]);
        assert_eq!(store.device_ids(b).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn protocol_wipe_keeps_contacts_and_account() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("records.redb")).unwrap();

        store.save_contact(&contact(1, "+15550001")).await.unwrap();
        store
            .store_pre_key(&PreKeyRecord { key_id: 1, key_pair: KeyPair::from_secret_bytes([1; 32]) })
            .await
            .unwrap();
        let account = AccountState { next_pre_key_id: 42, ..AccountState::default() };
        store.store_account(&account).await.unwrap();

        store.remove_all_protocol_data().await.unwrap();

        assert_eq!(store.pre_key_count().await.unwrap(), 0);
        assert_eq!(store.load_contacts().await.unwrap().len(), 1);
        assert_eq!(store.load_account().await.unwrap().next_pre_key_id, 42);
    }
}
