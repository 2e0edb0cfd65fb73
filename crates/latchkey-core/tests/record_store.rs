//! Contract tests shared by every `RecordStore` implementation, plus chaos
//! properties for the fault-injecting wrapper.
//!
//! - Writes are visible to later reads through any clone
//! - Message migration moves ownership without losing messages
//! - The protocol wipe leaves contacts, messages and account state alone
//! - Under injected failures, exactly the successful writes are visible

use latchkey_core::{
    ChaoticStore, MemoryStore, RecordStore, RedbStore, StoreError, StoreOp,
    model::{
        AccountState, ContactId, ContactRecord, GroupId, IdentityRecord, MessageRecord,
        PhoneNumber, PreKeyRecord, SessionRecord, SignedPreKeyRecord, StableId, VerifiedStatus,
    },
};
use latchkey_crypto::KeyPair;
use proptest::prelude::*;
use tempfile::tempdir;
use uuid::Uuid;

fn id(n: u128) -> ContactId {
    ContactId::from_uuid(Uuid::from_u128(n))
}

fn person(n: u128) -> ContactRecord {
    let mut record = ContactRecord::individual(id(n));
    record.phone_number = Some(PhoneNumber::new(&format!("+1555000{n:04}")).unwrap());
    record
}

fn message(id_: u64, owner: ContactId, sent_at: u64) -> MessageRecord {
    MessageRecord { id: id_, conversation_id: owner, sent_at, body: format!("m{id_}") }
}

fn signed_pre_key(key_id: u32) -> SignedPreKeyRecord {
    SignedPreKeyRecord {
        key_id,
        key_pair: KeyPair::from_secret_bytes([key_id as u8; 32]),
        signature: vec![0xAA; 64],
        created_at_ms: u64::from(key_id) * 1000,
        confirmed: false,
    }
}

async fn check_contacts<S: RecordStore>(store: S) {
    let clone = store.clone();
    let mut alice = person(1);
    alice.stable_id = Some(StableId::new("0d3c2f6e-6c1a-4c39-9d55-1f1a9e0b2a11").unwrap());
    store.save_contact(&alice).await.unwrap();
    store.save_contact(&person(2)).await.unwrap();

    let mut group = ContactRecord::group(id(10), GroupId::new("group-a").unwrap());
    group.members = vec![id(1), id(2)];
    store.save_contact(&group).await.unwrap();

    let mut loaded = clone.load_contacts().await.unwrap();
    loaded.sort_by_key(|c| c.id);
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded[0], alice);

    let groups = clone.groups_with_member(id(2)).await.unwrap();
    assert_eq!(groups, vec![group]);
    assert!(clone.groups_with_member(id(3)).await.unwrap().is_empty());

    store.remove_contact(id(2)).await.unwrap();
    store.remove_contact(id(99)).await.unwrap();
    assert_eq!(clone.load_contacts().await.unwrap().len(), 2);
}

async fn check_messages<S: RecordStore>(store: S) {
    let (a, b) = (id(1), id(2));
    store.save_message(&message(1, a, 30)).await.unwrap();
    store.save_message(&message(2, a, 10)).await.unwrap();
    store.save_message(&message(3, b, 20)).await.unwrap();

    let owned: Vec<u64> = store.messages_for(a).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(owned, vec![2, 1]);

    assert_eq!(store.migrate_messages(a, b).await.unwrap(), 2);
    assert!(store.messages_for(a).await.unwrap().is_empty());

    let owned: Vec<u64> = store.messages_for(b).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(owned, vec![2, 3, 1]);
}

async fn check_sessions_and_identities<S: RecordStore>(store: S) {
    let a = id(1);
    for device_id in [2, 1] {
        store.store_session(&SessionRecord { contact_id: a, device_id, data: vec![1] }).await.unwrap();
    }
    assert_eq!(store.device_ids(a).await.unwrap(), vec![1, 2]);

    store.remove_session(a, 1).await.unwrap();
    assert_eq!(store.device_ids(a).await.unwrap(), vec![2]);

    let identity = IdentityRecord {
        contact_id: a,
        public_key: vec![5; 64],
        first_use: true,
        timestamp_ms: 1,
        verified: VerifiedStatus::Default,
        nonblocking_approval: false,
    };
    store.save_identity(&identity).await.unwrap();
    assert_eq!(store.load_identity(a).await.unwrap(), Some(identity));

    store.remove_identity(a).await.unwrap();
    assert_eq!(store.load_identity(a).await.unwrap(), None);

    store.clear_sessions().await.unwrap();
    assert!(store.device_ids(a).await.unwrap().is_empty());
}

async fn check_keys_and_account<S: RecordStore>(store: S) {
    for key_id in 1..=3 {
        let pre_key = PreKeyRecord { key_id, key_pair: KeyPair::from_secret_bytes([key_id as u8; 32]) };
        store.store_pre_key(&pre_key).await.unwrap();
    }
    assert_eq!(store.pre_key_count().await.unwrap(), 3);
    store.remove_pre_key(2).await.unwrap();
    assert!(store.load_pre_key(2).await.unwrap().is_none());
    assert!(store.load_pre_key(3).await.unwrap().is_some());

    for key_id in [3, 1, 2] {
        store.store_signed_pre_key(&signed_pre_key(key_id)).await.unwrap();
    }
    let ids: Vec<u32> = store.load_signed_pre_keys().await.unwrap().iter().map(|k| k.key_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let mut confirmed = signed_pre_key(2);
    confirmed.confirmed = true;
    store.store_signed_pre_key(&confirmed).await.unwrap();
    assert_eq!(store.load_signed_pre_key(2).await.unwrap(), Some(confirmed));

    store.remove_signed_pre_key(1).await.unwrap();
    assert_eq!(store.load_signed_pre_keys().await.unwrap().len(), 2);

    assert_eq!(store.load_account().await.unwrap(), AccountState::default());
    let account = AccountState { next_pre_key_id: 101, ..AccountState::default() };
    store.store_account(&account).await.unwrap();
    assert_eq!(store.load_account().await.unwrap(), account);

    store.save_contact(&person(1)).await.unwrap();
    store.save_message(&message(1, id(1), 1)).await.unwrap();
    store.store_session(&SessionRecord { contact_id: id(1), device_id: 1, data: vec![] }).await.unwrap();

    store.remove_all_protocol_data().await.unwrap();

    assert_eq!(store.pre_key_count().await.unwrap(), 0);
    assert!(store.load_signed_pre_keys().await.unwrap().is_empty());
    assert!(store.device_ids(id(1)).await.unwrap().is_empty());
    assert_eq!(store.load_contacts().await.unwrap().len(), 1);
    assert_eq!(store.messages_for(id(1)).await.unwrap().len(), 1);
    assert_eq!(store.load_account().await.unwrap(), account);
}

#[tokio::test]
async fn memory_store_contract() {
    check_contacts(MemoryStore::new()).await;
    check_messages(MemoryStore::new()).await;
    check_sessions_and_identities(MemoryStore::new()).await;
    check_keys_and_account(MemoryStore::new()).await;
}

#[tokio::test]
async fn redb_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.redb");
    let account = AccountState { next_pre_key_id: 42, next_signed_pre_key_id: 7, ..AccountState::default() };

    {
        let store = RedbStore::open(&path).unwrap();
        store.save_contact(&person(1)).await.unwrap();
        store.store_signed_pre_key(&signed_pre_key(6)).await.unwrap();
        store.store_account(&account).await.unwrap();
    }

    let store = RedbStore::open(&path).unwrap();
    assert_eq!(store.load_contacts().await.unwrap(), vec![person(1)]);
    assert_eq!(store.load_signed_pre_key(6).await.unwrap(), Some(signed_pre_key(6)));
    assert_eq!(store.load_account().await.unwrap(), account);
}

#[tokio::test]
async fn redb_store_contract() {
    let dir = tempdir().unwrap();
    let open = |name: &str| RedbStore::open(dir.path().join(name)).unwrap();

    check_contacts(open("contacts.redb")).await;
    check_messages(open("messages.redb")).await;
    check_sessions_and_identities(open("sessions.redb")).await;
    check_keys_and_account(open("keys.redb")).await;
}

#[tokio::test]
async fn chaotic_store_without_failures_is_transparent() {
    let store = ChaoticStore::new(MemoryStore::new(), 0.0);
    check_keys_and_account(store.clone()).await;
    assert!(store.operation_count() > 0);
}

#[tokio::test]
async fn targeted_failure_hits_only_that_operation() {
    let store = ChaoticStore::targeted(MemoryStore::new());
    store.fail_on(StoreOp::RemoveAllProtocolData);

    store.save_contact(&person(1)).await.unwrap();
    let err = store.remove_all_protocol_data().await.unwrap_err();
    assert!(matches!(err, StoreError::Io(_)));
    assert!(err.is_transient());

    store.heal(StoreOp::RemoveAllProtocolData);
    store.remove_all_protocol_data().await.unwrap();
    assert_eq!(store.inner().contact_count(), 1);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_only_successful_saves_are_visible(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        count in 1u128..40,
    ) {
        let store = ChaoticStore::with_seed(MemoryStore::new(), failure_rate, seed);

        let saved = block_on(async {
            let mut saved = Vec::new();
            for n in 0..count {
                if store.save_contact(&person(n)).await.is_ok() {
                    saved.push(id(n));
                }
            }
            saved
        });

        let mut visible: Vec<ContactId> =
            block_on(store.inner().load_contacts()).unwrap().iter().map(|c| c.id).collect();
        visible.sort();

        prop_assert_eq!(visible, saved);
        prop_assert_eq!(store.operation_count(), count as usize);
    }
}
