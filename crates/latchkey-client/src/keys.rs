//! Prekey lifecycle.
//!
//! One-time prekeys are generated in batches and consumed by the server;
//! signed prekeys are rotated on a schedule and pruned so that a handful of
//! recent confirmed keys always remain for in-flight session setups.
//!
//! Key ids come from counters in the account state. Counters are advanced and
//! persisted before the keys are written, so an interrupted generation can
//! skip ids but never reuse one.

use std::time::Duration;

use latchkey_core::{
    Environment, RecordStore,
    model::{PreKeyRecord, SignedPreKeyRecord},
};
use latchkey_crypto::{IdentityKeyPair, IdentityPublicKey, KeyPair, generate_signed_pre_key};
use tracing::{debug, info, warn};

use crate::{
    api::{AccountApi, KeyUpload, PreKeyUpload, SignedPreKeyUpload},
    error::KeyError,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for prekey generation and signed prekey retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    /// One-time prekeys generated per batch
    pub pre_key_batch: u32,
    /// Refill when the server holds fewer than this many prekeys
    pub pre_key_refresh_threshold: usize,
    /// Confirmed signed prekeys always kept
    pub signed_key_floor: usize,
    /// Superseded signed prekeys older than this are removed
    pub archive_age: Duration,
    /// Minimum age of the newest confirmed key before rotating again
    pub rotation_interval: Duration,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            pre_key_batch: 100,
            pre_key_refresh_threshold: 10,
            signed_key_floor: 3,
            archive_age: DAY * 7,
            rotation_interval: DAY,
        }
    }
}

/// Keys produced by one [`KeyLifecycleManager::generate_keys`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKeys {
    /// Public identity key the signed prekey is bound to
    pub identity_key: IdentityPublicKey,
    /// New one-time prekeys, ascending ids
    pub pre_keys: Vec<PreKeyRecord>,
    /// New signed prekey, stored unconfirmed
    pub signed_pre_key: SignedPreKeyRecord,
}

impl GeneratedKeys {
    /// Public halves in upload form.
    pub fn to_upload(&self) -> KeyUpload {
        KeyUpload {
            identity_key: self.identity_key,
            signed_pre_key: signed_upload(&self.signed_pre_key),
            pre_keys: self
                .pre_keys
                .iter()
                .map(|k| PreKeyUpload { key_id: k.key_id, public_key: k.key_pair.public_key() })
                .collect(),
        }
    }
}

fn signed_upload(key: &SignedPreKeyRecord) -> SignedPreKeyUpload {
    SignedPreKeyUpload {
        key_id: key.key_id,
        public_key: key.key_pair.public_key(),
        signature: key.signature.clone(),
    }
}

/// What a rotation attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Enough recent confirmed keys; nothing generated
    Skipped,
    /// New key uploaded and confirmed
    Rotated {
        /// Id of the new signed prekey
        key_id: u32,
    },
    /// Server refused the new key; it stays stored unconfirmed
    Rejected {
        /// HTTP status of the refusal
        status: u16,
        /// Consecutive rejections including this one
        rejections: u32,
    },
}

/// Signed prekeys kept and removed by one prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Ids still stored
    pub kept: Vec<u32>,
    /// Ids deleted
    pub removed: Vec<u32>,
}

/// Snapshot of stored key material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySummary {
    /// One-time prekeys stored locally
    pub pre_keys: usize,
    /// Signed prekeys stored
    pub signed_pre_keys: usize,
    /// Of which confirmed
    pub confirmed_signed_pre_keys: usize,
    /// Creation time of the newest confirmed signed prekey
    pub newest_confirmed_at_ms: Option<u64>,
    /// Consecutive rotation rejections
    pub rotation_rejections: u32,
    /// Next one-time prekey id
    pub next_pre_key_id: u32,
    /// Next signed prekey id
    pub next_signed_pre_key_id: u32,
}

/// Generates, confirms, rotates and prunes prekeys.
///
/// Not serialized on its own; the registration coordinator runs these
/// operations on its account queue.
#[derive(Clone)]
pub struct KeyLifecycleManager<S: RecordStore, E: Environment> {
    store: S,
    env: E,
    policy: KeyPolicy,
}

impl<S: RecordStore, E: Environment> KeyLifecycleManager<S, E> {
    /// Create a manager over `store`.
    pub fn new(store: S, env: E, policy: KeyPolicy) -> Self {
        Self { store, env, policy }
    }

    /// Active policy.
    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Generate `count` one-time prekeys and one signed prekey.
    ///
    /// Prekey ids continue from the account counter; the signed prekey takes
    /// the next signed id. Everything is stored unconfirmed. `on_progress`
    /// receives the number of prekeys generated so far after each one. Stale
    /// signed prekeys are pruned afterwards.
    pub async fn generate_keys(
        &self,
        count: u32,
        mut on_progress: impl FnMut(u32) + Send,
    ) -> Result<GeneratedKeys, KeyError> {
        let mut account = self.store.load_account().await?;
        let identity = account.identity_key.clone().ok_or(KeyError::MissingIdentityKey)?;
        let first_id = account.next_pre_key_id;
        let signed_id = account.next_signed_pre_key_id;

        account.next_pre_key_id = first_id + count;
        account.next_signed_pre_key_id = signed_id + 1;
        self.store.store_account(&account).await?;

        let mut pre_keys = Vec::with_capacity(count as usize);
        for (done, key_id) in (first_id..first_id + count).enumerate() {
            let record =
                PreKeyRecord { key_id, key_pair: KeyPair::from_secret_bytes(self.env.random_key()) };
            self.store.store_pre_key(&record).await?;
            pre_keys.push(record);
            on_progress(done as u32 + 1);
        }

        let signed_pre_key = self.new_signed_pre_key(&identity, signed_id);
        self.store.store_signed_pre_key(&signed_pre_key).await?;
        info!(first_id, count, signed_id, "generated prekeys");

        self.clean_signed_pre_keys().await?;
        Ok(GeneratedKeys { identity_key: identity.public_key(), pre_keys, signed_pre_key })
    }

    fn new_signed_pre_key(&self, identity: &IdentityKeyPair, key_id: u32) -> SignedPreKeyRecord {
        let generated = generate_signed_pre_key(identity, key_id, self.env.random_key());
        SignedPreKeyRecord {
            key_id,
            key_pair: generated.key_pair,
            signature: generated.signature.to_vec(),
            created_at_ms: self.env.now_millis(),
            confirmed: false,
        }
    }

    /// Mark the signed prekey of `keys` as accepted by the server.
    pub async fn confirm_keys(&self, keys: &GeneratedKeys) -> Result<(), KeyError> {
        self.confirm_signed_pre_key(keys.signed_pre_key.key_id).await
    }

    async fn confirm_signed_pre_key(&self, key_id: u32) -> Result<(), KeyError> {
        let mut record = self
            .store
            .load_signed_pre_key(key_id)
            .await?
            .ok_or(KeyError::UnknownSignedPreKey(key_id))?;
        record.confirmed = true;
        self.store.store_signed_pre_key(&record).await?;
        debug!(key_id, "confirmed signed prekey");
        Ok(())
    }

    /// Replace the signed prekey unless a recent one is already in place.
    ///
    /// Skips when at least `signed_key_floor` keys are confirmed and the
    /// newest confirmed one is younger than `rotation_interval`. Otherwise a
    /// new key is stored unconfirmed, uploaded, confirmed, and old keys are
    /// pruned. A 4xx/5xx answer increments the persisted rejection counter and
    /// returns [`RotationOutcome::Rejected`]; other failures propagate.
    pub async fn rotate_signed_pre_key<A: AccountApi>(
        &self,
        api: &A,
    ) -> Result<RotationOutcome, KeyError> {
        let mut existing = self.store.load_signed_pre_keys().await?;
        newest_first(&mut existing);
        let confirmed: Vec<&SignedPreKeyRecord> = existing.iter().filter(|k| k.confirmed).collect();

        let now = self.env.now_millis();
        let cutoff = now.saturating_sub(millis(self.policy.rotation_interval));
        if confirmed.len() >= self.policy.signed_key_floor
            && confirmed.first().is_some_and(|newest| newest.created_at_ms > cutoff)
        {
            info!(confirmed = confirmed.len(), "recent confirmed signed prekeys exist, skipping rotation");
            return Ok(RotationOutcome::Skipped);
        }

        let mut account = self.store.load_account().await?;
        let Some(identity) = account.identity_key.clone() else {
            warn!("no identity key, cannot rotate signed prekey");
            return Err(KeyError::MissingIdentityKey);
        };

        let key_id = account.next_signed_pre_key_id;
        account.next_signed_pre_key_id = key_id + 1;
        self.store.store_account(&account).await?;

        let key = self.new_signed_pre_key(&identity, key_id);
        self.store.store_signed_pre_key(&key).await?;
        info!(key_id, "uploading new signed prekey");

        match api.set_signed_pre_key(&signed_upload(&key)).await {
            Ok(()) => {},
            Err(e) if e.is_rejection() => {
                let status = e.status().unwrap_or_default();
                let mut account = self.store.load_account().await?;
                account.signed_key_rotation_rejected += 1;
                self.store.store_account(&account).await?;
                let rejections = account.signed_key_rotation_rejected;
                warn!(key_id, status, rejections, "signed prekey rejected by server");
                return Ok(RotationOutcome::Rejected { status, rejections });
            },
            Err(e) => {
                warn!(key_id, error = %e, "signed prekey upload failed");
                return Err(e.into());
            },
        }

        self.confirm_signed_pre_key(key_id).await?;
        let mut account = self.store.load_account().await?;
        if account.signed_key_rotation_rejected != 0 {
            account.signed_key_rotation_rejected = 0;
            self.store.store_account(&account).await?;
        }

        self.clean_signed_pre_keys().await?;
        Ok(RotationOutcome::Rotated { key_id })
    }

    /// Prune superseded signed prekeys.
    ///
    /// Keys are ranked newest first. The newest `signed_key_floor` confirmed
    /// keys are always kept; older confirmed keys go once they exceed
    /// `archive_age`. If fewer than `signed_key_floor` confirmed keys remain,
    /// enough of the newest unconfirmed keys are kept to make up the
    /// difference; the other unconfirmed keys go once they exceed
    /// `archive_age`.
    pub async fn clean_signed_pre_keys(&self) -> Result<PruneReport, KeyError> {
        let mut all = self.store.load_signed_pre_keys().await?;
        newest_first(&mut all);

        let (confirmed, unconfirmed): (Vec<_>, Vec<_>) = all.into_iter().partition(|k| k.confirmed);
        debug!(
            newest = ?confirmed.first().map(|k| k.key_id),
            total = confirmed.len() + unconfirmed.len(),
            confirmed = confirmed.len(),
            "cleaning signed prekeys"
        );

        let now = self.env.now_millis();
        let archive = millis(self.policy.archive_age);
        let expired = |key: &SignedPreKeyRecord| now.saturating_sub(key.created_at_ms) > archive;

        let mut report = PruneReport::default();
        let mut confirmed_left = confirmed.len();

        for (rank, key) in confirmed.iter().enumerate() {
            if rank >= self.policy.signed_key_floor && expired(key) {
                info!(key_id = key.key_id, created_at_ms = key.created_at_ms, "removing confirmed signed prekey");
                self.store.remove_signed_pre_key(key.key_id).await?;
                report.removed.push(key.key_id);
                confirmed_left -= 1;
            } else {
                report.kept.push(key.key_id);
            }
        }

        let still_needed = self.policy.signed_key_floor.saturating_sub(confirmed_left);
        for (rank, key) in unconfirmed.iter().enumerate() {
            if rank >= still_needed && expired(key) {
                info!(key_id = key.key_id, created_at_ms = key.created_at_ms, "removing unconfirmed signed prekey");
                self.store.remove_signed_pre_key(key.key_id).await?;
                report.removed.push(key.key_id);
            } else {
                report.kept.push(key.key_id);
            }
        }

        Ok(report)
    }

    /// Delete every session, one-time prekey and signed prekey.
    pub async fn clear_sessions_and_pre_keys(&self) -> Result<(), KeyError> {
        info!("clearing all sessions, prekeys and signed prekeys");
        self.store.clear_pre_keys().await?;
        self.store.clear_signed_pre_keys().await?;
        self.store.clear_sessions().await?;
        Ok(())
    }

    /// Counts and counters for diagnostics.
    pub async fn key_summary(&self) -> Result<KeySummary, KeyError> {
        let account = self.store.load_account().await?;
        let signed = self.store.load_signed_pre_keys().await?;
        let confirmed = signed.iter().filter(|k| k.confirmed);

        Ok(KeySummary {
            pre_keys: self.store.pre_key_count().await?,
            signed_pre_keys: signed.len(),
            confirmed_signed_pre_keys: confirmed.clone().count(),
            newest_confirmed_at_ms: confirmed.map(|k| k.created_at_ms).max(),
            rotation_rejections: account.signed_key_rotation_rejected,
            next_pre_key_id: account.next_pre_key_id,
            next_signed_pre_key_id: account.next_signed_pre_key_id,
        })
    }
}

/// Sort by creation time descending, newer ids first on ties.
fn newest_first(keys: &mut [SignedPreKeyRecord]) {
    keys.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then(b.key_id.cmp(&a.key_id)));
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
