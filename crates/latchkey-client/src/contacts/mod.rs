//! Contact identity resolution.
//!
//! A remote account can be known by a phone number, by a server stable id, or
//! by both. Evidence arrives piecemeal and with different trust levels, so the
//! same person can end up as two records. [`ContactResolver`] keeps a single
//! canonical record per account:
//!
//! - [`ContactResolver::ensure_contact_ids`] maps whatever identifiers are
//!   known to one contact id, creating, updating or scheduling a merge
//! - [`ContactResolver::combine_contacts`] folds an obsolete record into the
//!   current one, moving everything that referenced it
//! - [`ContactResolver::check_for_conflicts`] sweeps the whole index for
//!   duplicates left behind by older versions or interrupted merges
//!
//! The index lives behind a `std::sync::Mutex` that is never held across an
//! await. Merges go through a dedicated [`TaskSerializer`] so two merges
//! never interleave their store writes.

#![allow(clippy::disallowed_types, reason = "Index lock is never held across an await")]

mod index;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use latchkey_core::{
    Environment, RecordStore, TaskSerializer,
    model::{AccountState, ContactId, ContactKind, ContactRecord, GroupId, PhoneNumber, StableId},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use self::index::ContactIndex;
use crate::error::ResolverError;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

/// How far the caller vouches for the pairing of phone number and stable id.
///
/// High trust comes from the server or from our own account state; low trust
/// from anything a peer could have forged. Only high trust moves identifiers
/// between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Identifiers may be recorded but never reassigned
    Low,
    /// Identifiers may be attached, moved and merged
    High,
}

/// Observable outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    /// `obsolete` was folded into `current` and no longer exists
    ContactsCombined {
        /// Surviving contact
        current: ContactId,
        /// Removed contact
        obsolete: ContactId,
    },

    /// A background merge failed; both records are left in place
    CombineFailed {
        /// Intended survivor
        current: ContactId,
        /// Intended removal
        obsolete: ContactId,
        /// What went wrong
        error: ResolverError,
    },
}

/// Counters from one conflict sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records visited
    pub examined: usize,
    /// Successful merges
    pub merged: usize,
    /// Phone numbers removed from an older record
    pub numbers_stripped: usize,
    /// Merges or strips that failed and were skipped
    pub failures: usize,
}

/// Canonical contact lookup and merge service.
///
/// Cheap to clone; clones share the index, the merge queue and the event
/// channel.
pub struct ContactResolver<S: RecordStore, E: Environment> {
    inner: Arc<Shared<S, E>>,
}

struct Shared<S, E> {
    store: S,
    env: E,
    index: Mutex<ContactIndex>,
    merges: TaskSerializer,
    events: broadcast::Sender<ResolverEvent>,
}

impl<S: RecordStore, E: Environment> Clone for ContactResolver<S, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Result of applying the decision table to the index.
struct Resolution {
    id: ContactId,
    writes: Vec<ContactRecord>,
    merge: Option<(ContactId, ContactId)>,
}

impl Resolution {
    fn found(id: ContactId) -> Self {
        Self { id, writes: Vec::new(), merge: None }
    }
}

impl<S: RecordStore, E: Environment> ContactResolver<S, E> {
    /// Create an unloaded resolver. Call [`Self::load`] before anything else.
    pub fn new(store: S, env: E) -> Self {
        Self::with_merge_queue(store, env, TaskSerializer::new("contact-merges"))
    }

    /// Create an unloaded resolver with a caller-configured merge queue.
    pub fn with_merge_queue(store: S, env: E, merges: TaskSerializer) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Shared {
                store,
                env,
                index: Mutex::new(ContactIndex::new()),
                merges,
                events,
            }),
        }
    }

    #[allow(clippy::expect_used)]
    fn index(&self) -> MutexGuard<'_, ContactIndex> {
        self.inner.index.lock().expect("invariant: contact index lock is never poisoned")
    }

    fn snapshot(&self, id: ContactId) -> Option<ContactRecord> {
        self.index().get(id).cloned()
    }

    /// Load every stored contact into the index.
    ///
    /// Returns the number of records loaded. May only succeed once; a failed
    /// store read leaves the resolver unloaded so the load can be retried.
    pub async fn load(&self) -> Result<usize, ResolverError> {
        self.index().begin_load()?;

        match self.inner.store.load_contacts().await {
            Ok(records) => {
                let count = records.len();
                self.index().finish_load(records);
                info!(count, "contacts loaded");
                Ok(count)
            },
            Err(e) => {
                self.index().abort_load();
                warn!(error = %e, "contact load failed");
                Err(e.into())
            },
        }
    }

    /// Whether [`Self::load`] has completed.
    pub fn is_loaded(&self) -> bool {
        self.index().is_loaded()
    }

    /// Record by contact id.
    pub fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, ResolverError> {
        let index = self.index();
        index.ensure_loaded()?;
        Ok(index.get(id).cloned())
    }

    /// Record by contact id, stable id, phone number or group id.
    pub fn lookup(&self, identifier: &str) -> Result<Option<ContactRecord>, ResolverError> {
        let index = self.index();
        index.ensure_loaded()?;
        Ok(index.lookup(identifier).cloned())
    }

    /// Number of indexed contacts, including unsaved ones.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    /// Whether the index holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every indexed contact, oldest activity first.
    pub fn contacts(&self) -> Vec<ContactRecord> {
        self.index().by_age()
    }

    /// Subscribe to merge outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolverEvent> {
        self.inner.events.subscribe()
    }

    /// Existing record for `identifier`, or a new one.
    ///
    /// Groups get `group_id`; a UUID-shaped identifier becomes the stable id;
    /// anything else is taken as a phone number. New records are persisted.
    pub async fn get_or_create(
        &self,
        identifier: &str,
        kind: ContactKind,
    ) -> Result<ContactRecord, ResolverError> {
        let record = {
            let mut index = self.index();
            index.ensure_loaded()?;
            if let Some(existing) = index.lookup(identifier) {
                return Ok(existing.clone());
            }

            let record = self.new_record(identifier, kind)?;
            index.upsert(record.clone());
            record
        };

        info!(id = %record.id, ?kind, "contact created");
        if record.is_valid() {
            self.inner.store.save_contact(&record).await?;
        }
        Ok(record)
    }

    fn new_record(&self, identifier: &str, kind: ContactKind) -> Result<ContactRecord, ResolverError> {
        let id = ContactId::generate(&self.inner.env);
        let record = match kind {
            ContactKind::Group => ContactRecord::group(id, GroupId::new(identifier)?),
            ContactKind::Individual if StableId::looks_like(identifier) => ContactRecord {
                stable_id: Some(StableId::new(identifier)?),
                ..ContactRecord::individual(id)
            },
            ContactKind::Individual => ContactRecord {
                phone_number: Some(PhoneNumber::new(identifier)?),
                ..ContactRecord::individual(id)
            },
        };
        Ok(record)
    }

    /// Group contact for `group_id`, created if unknown.
    pub async fn ensure_group(&self, group_id: &str) -> Result<ContactId, ResolverError> {
        Ok(self.get_or_create(group_id, ContactKind::Group).await?.id)
    }

    /// Contact id for our own account, resolved with low trust.
    ///
    /// `None` until the account has a number or stable id.
    pub async fn our_contact_id(
        &self,
        account: &AccountState,
    ) -> Result<Option<ContactId>, ResolverError> {
        self.ensure_contact_ids(
            account.number.as_ref().map(PhoneNumber::as_str),
            account.stable_id.as_ref().map(StableId::as_str),
            Trust::Low,
        )
        .await
    }

    /// Canonical contact id for a phone number and/or stable id.
    ///
    /// Returns `Ok(None)` when neither identifier is given. Lookups are made
    /// independently by phone and by stable id, then resolved first match
    /// wins:
    ///
    /// 1. Neither matches: create a record. The phone number is recorded when
    ///    it is the only identifier or trust is high. The record is persisted
    ///    only once it carries both identifiers.
    /// 2. Only the phone matches: without a stable id, return it. If the match
    ///    has no stable id, attach ours under high trust. If it has a different
    ///    one, create a record for our stable id and, under high trust, move
    ///    the phone number onto it.
    /// 3. Only the stable id matches: under high trust attach the phone.
    /// 4. Both match the same record: return it.
    /// 5. Both match different records: under high trust, a phone record that
    ///    carries another stable id loses its number to ours; otherwise the
    ///    records are a split contact and the phone record is merged into the
    ///    stable id record in the background. Low trust changes nothing.
    ///
    /// Cases 2 to 5 return the stable id record whenever one exists.
    pub async fn ensure_contact_ids(
        &self,
        phone: Option<&str>,
        stable_id: Option<&str>,
        trust: Trust,
    ) -> Result<Option<ContactId>, ResolverError> {
        let phone = present(phone).map(PhoneNumber::new).transpose()?;
        let stable_id = present(stable_id).map(StableId::new).transpose()?;
        if phone.is_none() && stable_id.is_none() {
            return Ok(None);
        }

        let (resolution, matched) = {
            let mut index = self.index();
            index.ensure_loaded()?;
            let matched: Vec<ContactRecord> = [
                phone.as_ref().and_then(|p| index.by_phone(p)),
                stable_id.as_ref().and_then(|s| index.by_stable_id(s)),
            ]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
            (self.resolve(&mut index, phone, stable_id, trust == Trust::High), matched)
        };

        for (written, record) in resolution.writes.iter().enumerate() {
            if let Err(e) = self.inner.store.save_contact(record).await {
                warn!(id = %record.id, error = %e, "contact write failed, reverting index");
                self.revert(&resolution.writes[written..], &matched);
                return Err(e.into());
            }
        }
        if let Some((current, obsolete)) = resolution.merge {
            self.schedule_merge(current, obsolete);
        }
        Ok(Some(resolution.id))
    }

    fn resolve(
        &self,
        index: &mut ContactIndex,
        phone: Option<PhoneNumber>,
        stable_id: Option<StableId>,
        high_trust: bool,
    ) -> Resolution {
        let by_phone = phone.as_ref().and_then(|p| index.by_phone(p)).cloned();
        let by_stable = stable_id.as_ref().and_then(|s| index.by_stable_id(s)).cloned();

        match (by_phone, by_stable) {
            (None, None) => {
                let mut record = ContactRecord::individual(ContactId::generate(&self.inner.env));
                if stable_id.is_none() || high_trust {
                    record.phone_number = phone;
                }
                record.stable_id = stable_id;
                index.upsert(record.clone());

                let complete = record.phone_number.is_some() && record.stable_id.is_some();
                info!(id = %record.id, high_trust, persisted = complete, "no match, contact created");
                let writes = if complete { vec![record.clone()] } else { Vec::new() };
                Resolution { id: record.id, writes, merge: None }
            },

            (Some(mut by_phone), None) => {
                let Some(stable_id) = stable_id else {
                    return Resolution::found(by_phone.id);
                };

                if by_phone.stable_id.is_none() {
                    if !high_trust {
                        return Resolution::found(by_phone.id);
                    }
                    info!(id = %by_phone.id, "adding stable id to phone-only match");
                    by_phone.stable_id = Some(stable_id);
                    index.upsert(by_phone.clone());
                    return Resolution { id: by_phone.id, writes: vec![by_phone], merge: None };
                }

                let mut fresh = ContactRecord::individual(ContactId::generate(&self.inner.env));
                fresh.stable_id = Some(stable_id);
                info!(old = %by_phone.id, new = %fresh.id, "phone match has another stable id, creating contact");

                if !high_trust {
                    index.upsert(fresh.clone());
                    return Resolution::found(fresh.id);
                }

                info!(old = %by_phone.id, new = %fresh.id, "moving phone number to new contact");
                by_phone.phone_number = None;
                fresh.phone_number = phone;
                index.upsert(by_phone.clone());
                index.upsert(fresh.clone());
                Resolution { id: fresh.id, writes: vec![fresh, by_phone], merge: None }
            },

            (None, Some(mut by_stable)) => {
                if high_trust && let Some(phone) = phone {
                    info!(id = %by_stable.id, "adding phone number to stable-id-only match");
                    by_stable.phone_number = Some(phone);
                    index.upsert(by_stable.clone());
                    return Resolution { id: by_stable.id, writes: vec![by_stable], merge: None };
                }
                Resolution::found(by_stable.id)
            },

            (Some(by_phone), Some(by_stable)) if by_phone.id == by_stable.id => {
                Resolution::found(by_stable.id)
            },

            (Some(mut by_phone), Some(mut by_stable)) => {
                if !high_trust {
                    return Resolution::found(by_stable.id);
                }

                if by_phone.stable_id.as_ref().is_some_and(|s| Some(s) != stable_id.as_ref()) {
                    info!(
                        from = %by_phone.id,
                        to = %by_stable.id,
                        "phone record already has a stable id, moving phone number"
                    );
                    by_phone.phone_number = None;
                    by_stable.phone_number = phone;
                    index.upsert(by_phone.clone());
                    index.upsert(by_stable.clone());
                    return Resolution {
                        id: by_stable.id,
                        writes: vec![by_stable, by_phone],
                        merge: None,
                    };
                }

                info!(current = %by_stable.id, obsolete = %by_phone.id, "split contact found, merging");
                by_stable.phone_number = phone;
                index.upsert(by_stable.clone());
                Resolution {
                    id: by_stable.id,
                    writes: vec![by_stable.clone()],
                    merge: Some((by_stable.id, by_phone.id)),
                }
            },
        }
    }

    /// Put unsaved records back to their state before resolution.
    ///
    /// `matched` holds the records the lookups found; anything else among
    /// `unsaved` was created by the resolution and is dropped.
    fn revert(&self, unsaved: &[ContactRecord], matched: &[ContactRecord]) {
        let mut index = self.index();
        for record in unsaved {
            let previous = matched.iter().find(|m| m.id == record.id).cloned();
            index.restore(record, previous);
        }
    }

    fn schedule_merge(&self, current: ContactId, obsolete: ContactId) {
        let resolver = self.clone();
        tokio::spawn(async move {
            if let Err(error) = resolver.combine_contacts(current, obsolete).await {
                warn!(%current, %obsolete, %error, "background merge failed");
                // No subscribers is fine
                let _ = resolver.inner.events.send(ResolverEvent::CombineFailed {
                    current,
                    obsolete,
                    error,
                });
            }
        });
    }

    /// Fold `obsolete` into `current`.
    ///
    /// Copies the profile key if `current` has none, deletes the sessions and
    /// identity record of `obsolete`, repoints group membership (without
    /// duplicates), moves its messages, removes the obsolete record and drops
    /// it from the index. Runs on the merge queue. Emits
    /// [`ResolverEvent::ContactsCombined`] on success.
    ///
    /// Store writes are sequential; a failure part way leaves `obsolete` in
    /// the index so a later sweep can finish the job.
    pub async fn combine_contacts(
        &self,
        current: ContactId,
        obsolete: ContactId,
    ) -> Result<(), ResolverError> {
        self.inner.merges.run(self.combine_now(current, obsolete)).await?
    }

    async fn combine_now(&self, current: ContactId, obsolete: ContactId) -> Result<(), ResolverError> {
        if current == obsolete {
            return Err(ResolverError::SelfMerge(current));
        }

        let inherited_key = {
            let index = self.index();
            index.ensure_loaded()?;
            let survivor = index.get(current).ok_or(ResolverError::UnknownContact(current))?;
            let old = index.get(obsolete).ok_or(ResolverError::UnknownContact(obsolete))?;
            if survivor.profile_key.is_none() { old.profile_key } else { None }
        };
        info!(%current, %obsolete, "combining contacts");
        let store = &self.inner.store;

        if let Some(key) = inherited_key {
            debug!(%current, "copying profile key from obsolete contact");
            let updated = self.update(current, |record| {
                if record.profile_key.is_none() {
                    record.profile_key = Some(key);
                }
            });
            if let Some(record) = updated.filter(ContactRecord::is_valid) {
                store.save_contact(&record).await?;
            }
        }

        let devices = store.device_ids(obsolete).await?;
        debug!(%obsolete, sessions = devices.len(), "deleting sessions of obsolete contact");
        for device_id in devices {
            store.remove_session(obsolete, device_id).await?;
        }
        store.remove_identity(obsolete).await?;

        for stored in store.groups_with_member(obsolete).await? {
            let group = {
                let mut index = self.index();
                let mut group = index.get(stored.id).cloned().unwrap_or(stored);
                group.members.retain(|member| *member != obsolete);
                if !group.members.contains(&current) {
                    group.members.push(current);
                }
                index.upsert(group.clone());
                group
            };
            debug!(group = %group.id, "repointing group membership");
            store.save_contact(&group).await?;
        }

        // Obsolete stays stored and indexed until its messages have moved
        let moved = store.migrate_messages(obsolete, current).await?;
        store.remove_contact(obsolete).await?;
        self.index().remove(obsolete);

        info!(%current, %obsolete, moved, "contacts combined");
        let _ = self.inner.events.send(ResolverEvent::ContactsCombined { current, obsolete });
        Ok(())
    }

    /// Apply `change` to the indexed record, returning the updated copy.
    fn update(
        &self,
        id: ContactId,
        change: impl FnOnce(&mut ContactRecord),
    ) -> Option<ContactRecord> {
        let mut index = self.index();
        let mut record = index.get(id).cloned()?;
        change(&mut record);
        index.upsert(record.clone());
        Some(record)
    }

    /// Sweep the index for duplicate stable ids and phone numbers.
    ///
    /// Visits records oldest activity first, so that where a later record
    /// wins, the most recently active duplicate survives.
    ///
    /// - Shared stable id: keep the later record if it has a phone number,
    ///   otherwise the earlier one, and merge the other into it.
    /// - Shared phone number with two different stable ids: remove the number
    ///   from the earlier record.
    /// - Otherwise shared phone number: keep the later record if it has a
    ///   stable id, otherwise the earlier one, and merge.
    ///
    /// Best effort: a failed merge is logged, counted and skipped.
    pub async fn check_for_conflicts(&self) -> Result<SweepReport, ResolverError> {
        let candidates = {
            let index = self.index();
            index.ensure_loaded()?;
            index.by_age()
        };
        info!(count = candidates.len(), "conflict sweep starting");

        let mut report = SweepReport::default();
        let mut by_stable: HashMap<StableId, ContactId> = HashMap::new();
        let mut by_phone: HashMap<PhoneNumber, ContactId> = HashMap::new();

        for candidate in candidates {
            report.examined += 1;
            let Some(record) = self.snapshot(candidate.id) else {
                continue;
            };

            if let Some(stable_id) = record.stable_id.clone() {
                match by_stable.get(&stable_id).and_then(|id| self.snapshot(*id)) {
                    Some(existing) if existing.id != record.id => {
                        info!(%stable_id, "sweep found duplicate stable id");
                        let (keep, drop) = if record.phone_number.is_some() {
                            (record.id, existing.id)
                        } else {
                            (existing.id, record.id)
                        };
                        if self.sweep_merge(keep, drop, &mut report).await {
                            by_stable.insert(stable_id, keep);
                        }
                    },
                    _ => {
                        by_stable.insert(stable_id, record.id);
                    },
                }
            }

            let Some(record) = self.snapshot(record.id) else {
                continue;
            };
            let Some(phone) = record.phone_number.clone() else {
                continue;
            };

            match by_phone.get(&phone).and_then(|id| self.snapshot(*id)) {
                Some(existing) if existing.id != record.id => {
                    if let (Some(ours), Some(theirs)) = (&record.stable_id, &existing.stable_id)
                        && ours != theirs
                    {
                        info!(%phone, older = %existing.id, "two stable ids share a phone number, dropping it from the older contact");
                        match self.strip_phone(existing.id, &phone).await {
                            Ok(()) => report.numbers_stripped += 1,
                            Err(error) => {
                                warn!(id = %existing.id, %error, "failed to strip phone number");
                                report.failures += 1;
                            },
                        }
                        by_phone.insert(phone, record.id);
                        continue;
                    }

                    info!(%phone, "sweep found duplicate phone number");
                    let (keep, drop) = if record.stable_id.is_some() {
                        (record.id, existing.id)
                    } else {
                        (existing.id, record.id)
                    };
                    if self.sweep_merge(keep, drop, &mut report).await {
                        by_phone.insert(phone, keep);
                    }
                },
                _ => {
                    by_phone.insert(phone, record.id);
                },
            }
        }

        info!(
            examined = report.examined,
            merged = report.merged,
            stripped = report.numbers_stripped,
            failures = report.failures,
            "conflict sweep complete"
        );
        Ok(report)
    }

    async fn sweep_merge(&self, keep: ContactId, drop: ContactId, report: &mut SweepReport) -> bool {
        match self.combine_contacts(keep, drop).await {
            Ok(()) => {
                report.merged += 1;
                true
            },
            Err(error) => {
                warn!(current = %keep, obsolete = %drop, %error, "sweep merge failed, continuing");
                report.failures += 1;
                false
            },
        }
    }

    async fn strip_phone(&self, id: ContactId, phone: &PhoneNumber) -> Result<(), ResolverError> {
        let updated = self.update(id, |record| {
            if record.phone_number.as_ref() == Some(phone) {
                record.phone_number = None;
            }
        });
        if let Some(record) = updated.filter(ContactRecord::is_valid) {
            self.inner.store.save_contact(&record).await?;
        }
        Ok(())
    }
}

/// Treat blank identifiers as absent.
fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use latchkey_core::{MemoryStore, SystemEnv};

    use super::*;

    const STABLE: &str = "6a1e0b2c-0000-4000-8000-000000000001";

    async fn resolver() -> ContactResolver<MemoryStore, SystemEnv> {
        let resolver = ContactResolver::new(MemoryStore::new(), SystemEnv::new());
        resolver.load().await.unwrap();
        resolver
    }

    #[tokio::test]
    async fn operations_wait_for_load() {
        let resolver = ContactResolver::new(MemoryStore::new(), SystemEnv::new());

        assert_eq!(
            resolver.ensure_contact_ids(Some("+15550001"), None, Trust::High).await,
            Err(ResolverError::NotLoaded)
        );
        assert_eq!(resolver.check_for_conflicts().await, Err(ResolverError::NotLoaded));

        resolver.load().await.unwrap();
        assert_eq!(resolver.load().await, Err(ResolverError::AlreadyLoaded));
    }

    #[tokio::test]
    async fn no_identifiers_resolves_to_nothing() {
        let resolver = resolver().await;
        assert_eq!(resolver.ensure_contact_ids(None, None, Trust::High).await, Ok(None));
        assert_eq!(resolver.ensure_contact_ids(Some(" "), Some(""), Trust::High).await, Ok(None));
        assert!(resolver.is_empty());
    }

    #[tokio::test]
    async fn get_or_create_classifies_identifier() {
        let resolver = resolver().await;

        let by_stable = resolver.get_or_create(STABLE, ContactKind::Individual).await.unwrap();
        assert_eq!(by_stable.stable_id.as_ref().map(StableId::as_str), Some(STABLE));

        let by_phone = resolver.get_or_create("+15550001", ContactKind::Individual).await.unwrap();
        assert_eq!(by_phone.phone_number.as_ref().map(PhoneNumber::as_str), Some("+15550001"));

        let group = resolver.get_or_create("family", ContactKind::Group).await.unwrap();
        assert!(group.is_group());

        let again = resolver.get_or_create("+15550001", ContactKind::Individual).await.unwrap();
        assert_eq!(again.id, by_phone.id);
        assert_eq!(resolver.len(), 3);
    }

    #[tokio::test]
    async fn blank_identifier_is_rejected() {
        let resolver = resolver().await;
        let err = resolver.get_or_create("  ", ContactKind::Individual).await.unwrap_err();
        assert!(matches!(err, ResolverError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn self_merge_is_refused() {
        let resolver = resolver().await;
        let id = resolver.ensure_group("family").await.unwrap();
        assert_eq!(resolver.combine_contacts(id, id).await, Err(ResolverError::SelfMerge(id)));
    }

    #[tokio::test]
    async fn low_trust_phone_is_recorded_only_without_stable_id() {
        let resolver = resolver().await;

        let id = resolver
            .ensure_contact_ids(Some("+15550001"), Some(STABLE), Trust::Low)
            .await
            .unwrap()
            .unwrap();

        let record = resolver.get(id).unwrap().unwrap();
        assert!(record.phone_number.is_none());
        assert!(record.stable_id.is_some());
    }
}
