//! Chaotic record store wrapper for fault injection testing
//!
//! Wraps another store and fails operations either at random (seeded, so runs
//! are reproducible) or on explicitly targeted operations. Used to check that
//! merges log and continue, and that registration survives a failed wipe.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use super::{RecordStore, StoreError};
use crate::model::{
    AccountState, ContactId, ContactRecord, IdentityRecord, MessageRecord, PreKeyRecord,
    SessionRecord, SignedPreKeyRecord,
};

/// Record store operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StoreOp {
    LoadContacts,
    SaveContact,
    RemoveContact,
    GroupsWithMember,
    SaveMessage,
    MessagesFor,
    MigrateMessages,
    StoreSession,
    DeviceIds,
    RemoveSession,
    ClearSessions,
    SaveIdentity,
    LoadIdentity,
    RemoveIdentity,
    StorePreKey,
    LoadPreKey,
    RemovePreKey,
    ClearPreKeys,
    PreKeyCount,
    StoreSignedPreKey,
    LoadSignedPreKey,
    LoadSignedPreKeys,
    RemoveSignedPreKey,
    ClearSignedPreKeys,
    LoadAccount,
    StoreAccount,
    RemoveAllProtocolData,
}

/// Chaotic store wrapper that injects failures
///
/// Delegates to an underlying store. Clones share the RNG, the targeted
/// failure set and the operation counter.
#[derive(Clone)]
pub struct ChaoticStore<S: RecordStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations that always fail until cleared
    targeted: Arc<Mutex<HashSet<StoreOp>>>,
    /// Operation counter
    operation_count: Arc<Mutex<usize>>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator: fast, and reproducible from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

impl<S: RecordStore> ChaoticStore<S> {
    /// Wrap a store with a random failure rate.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            targeted: Arc::new(Mutex::new(HashSet::new())),
            operation_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Wrap a store that only fails on targeted operations.
    pub fn targeted(inner: S) -> Self {
        Self::with_seed(inner, 0.0, 0)
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make every future call of `op` fail.
    #[allow(clippy::expect_used)]
    pub fn fail_on(&self, op: StoreOp) {
        self.targeted.lock().expect("targeted mutex poisoned").insert(op);
    }

    /// Stop failing `op` (random failures still apply).
    #[allow(clippy::expect_used)]
    pub fn heal(&self, op: StoreOp) {
        self.targeted.lock().expect("targeted mutex poisoned").remove(&op);
    }

    /// Total number of store operations attempted.
    #[allow(clippy::expect_used)]
    pub fn operation_count(&self) -> usize {
        *self.operation_count.lock().expect("operation_count mutex poisoned")
    }

    /// Count the operation and decide whether it fails.
    #[allow(clippy::expect_used)]
    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        *self.operation_count.lock().expect("operation_count mutex poisoned") += 1;

        let targeted = self.targeted.lock().expect("targeted mutex poisoned").contains(&op);
        let random =
            self.rng.lock().expect("ChaoticRng mutex poisoned").should_fail(self.failure_rate);

        if targeted || random {
            tracing::debug!(?op, targeted, "injecting store failure");
            return Err(StoreError::Io(format!("chaotic failure injection: {op:?}")));
        }
        Ok(())
    }
}

impl<S: RecordStore> RecordStore for ChaoticStore<S> {
    async fn load_contacts(&self) -> Result<Vec<ContactRecord>, StoreError> {
        self.check(StoreOp::LoadContacts)?;
        self.inner.load_contacts().await
    }

    async fn save_contact(&self, contact: &ContactRecord) -> Result<(), StoreError> {
        self.check(StoreOp::SaveContact)?;
        self.inner.save_contact(contact).await
    }

    async fn remove_contact(&self, id: ContactId) -> Result<(), StoreError> {
        self.check(StoreOp::RemoveContact)?;
        self.inner.remove_contact(id).await
    }

    async fn groups_with_member(&self, member: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        self.check(StoreOp::GroupsWithMember)?;
        self.inner.groups_with_member(member).await
    }

    async fn save_message(&self, message: &MessageRecord) -> Result<(), StoreError> {
        self.check(StoreOp::SaveMessage)?;
        self.inner.save_message(message).await
    }

    async fn messages_for(&self, conversation: ContactId) -> Result<Vec<MessageRecord>, StoreError> {
        self.check(StoreOp::MessagesFor)?;
        self.inner.messages_for(conversation).await
    }

    async fn migrate_messages(&self, from: ContactId, to: ContactId) -> Result<usize, StoreError> {
        self.check(StoreOp::MigrateMessages)?;
        self.inner.migrate_messages(from, to).await
    }

    async fn store_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check(StoreOp::StoreSession)?;
        self.inner.store_session(session).await
    }

    async fn device_ids(&self, contact: ContactId) -> Result<Vec<u32>, StoreError> {
        self.check(StoreOp::DeviceIds)?;
        self.inner.device_ids(contact).await
    }

    async fn remove_session(&self, contact: ContactId, device_id: u32) -> Result<(), StoreError> {
        self.check(StoreOp::RemoveSession)?;
        self.inner.remove_session(contact, device_id).await
    }

    async fn clear_sessions(&self) -> Result<(), StoreError> {
        self.check(StoreOp::ClearSessions)?;
        self.inner.clear_sessions().await
    }

    async fn save_identity(&self, identity: &IdentityRecord) -> Result<(), StoreError> {
        self.check(StoreOp::SaveIdentity)?;
        self.inner.save_identity(identity).await
    }

    async fn load_identity(&self, contact: ContactId) -> Result<Option<IdentityRecord>, StoreError> {
        self.check(StoreOp::LoadIdentity)?;
        self.inner.load_identity(contact).await
    }

    async fn remove_identity(&self, contact: ContactId) -> Result<(), StoreError> {
        self.check(StoreOp::RemoveIdentity)?;
        self.inner.remove_identity(contact).await
    }

    async fn store_pre_key(&self, pre_key: &PreKeyRecord) -> Result<(), StoreError> {
        self.check(StoreOp::StorePreKey)?;
        self.inner.store_pre_key(pre_key).await
    }

    async fn load_pre_key(&self, key_id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        self.check(StoreOp::LoadPreKey)?;
        self.inner.load_pre_key(key_id).await
    }

    async fn remove_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.check(StoreOp::RemovePreKey)?;
        self.inner.remove_pre_key(key_id).await
    }

    async fn clear_pre_keys(&self) -> Result<(), StoreError> {
        self.check(StoreOp::ClearPreKeys)?;
        self.inner.clear_pre_keys().await
    }

    async fn pre_key_count(&self) -> Result<usize, StoreError> {
        self.check(StoreOp::PreKeyCount)?;
        self.inner.pre_key_count().await
    }

    async fn store_signed_pre_key(&self, signed_pre_key: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.check(StoreOp::StoreSignedPreKey)?;
        self.inner.store_signed_pre_key(signed_pre_key).await
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.check(StoreOp::LoadSignedPreKey)?;
        self.inner.load_signed_pre_key(key_id).await
    }

    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        self.check(StoreOp::LoadSignedPreKeys)?;
        self.inner.load_signed_pre_keys().await
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> Result<(), StoreError> {
        self.check(StoreOp::RemoveSignedPreKey)?;
        self.inner.remove_signed_pre_key(key_id).await
    }

    async fn clear_signed_pre_keys(&self) -> Result<(), StoreError> {
        self.check(StoreOp::ClearSignedPreKeys)?;
        self.inner.clear_signed_pre_keys().await
    }

    async fn load_account(&self) -> Result<AccountState, StoreError> {
        self.check(StoreOp::LoadAccount)?;
        self.inner.load_account().await
    }

    async fn store_account(&self, account: &AccountState) -> Result<(), StoreError> {
        self.check(StoreOp::StoreAccount)?;
        self.inner.store_account(account).await
    }

    async fn remove_all_protocol_data(&self) -> Result<(), StoreError> {
        self.check(StoreOp::RemoveAllProtocolData)?;
        self.inner.remove_all_protocol_data().await
    }
}
