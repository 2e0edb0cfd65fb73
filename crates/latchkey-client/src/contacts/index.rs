//! In-memory contact index.
//!
//! Primary map from contact id to record plus three auxiliary maps (stable
//! id, phone number, group id). Each record also carries the sequence number
//! at which it entered the index; that order breaks `active_at` ties during
//! the conflict sweep and decides which record an auxiliary key points at
//! after a rebuild (later wins).

use std::collections::HashMap;

use latchkey_core::model::{ContactId, ContactRecord, GroupId, PhoneNumber, StableId};

use crate::error::ResolverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
}

#[derive(Debug)]
struct Entry {
    record: ContactRecord,
    seq: u64,
}

#[derive(Debug)]
pub(crate) struct ContactIndex {
    state: LoadState,
    records: HashMap<ContactId, Entry>,
    by_stable_id: HashMap<StableId, ContactId>,
    by_phone: HashMap<PhoneNumber, ContactId>,
    by_group: HashMap<GroupId, ContactId>,
    next_seq: u64,
}

impl ContactIndex {
    pub(crate) fn new() -> Self {
        Self {
            state: LoadState::NotLoaded,
            records: HashMap::new(),
            by_stable_id: HashMap::new(),
            by_phone: HashMap::new(),
            by_group: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Claim the one-time load. Fails if a load already started.
    pub(crate) fn begin_load(&mut self) -> Result<(), ResolverError> {
        if self.state != LoadState::NotLoaded {
            return Err(ResolverError::AlreadyLoaded);
        }
        self.state = LoadState::Loading;
        Ok(())
    }

    /// Release the load claim after a failed store read.
    pub(crate) fn abort_load(&mut self) {
        if self.state == LoadState::Loading {
            self.state = LoadState::NotLoaded;
        }
    }

    /// Install loaded records, oldest activity first.
    pub(crate) fn finish_load(&mut self, mut records: Vec<ContactRecord>) {
        records.sort_by_key(|r| (r.active_at.unwrap_or(0), r.id));
        for record in records {
            self.upsert(record);
        }
        self.state = LoadState::Loaded;
    }

    pub(crate) fn ensure_loaded(&self) -> Result<(), ResolverError> {
        match self.state {
            LoadState::Loaded => Ok(()),
            LoadState::NotLoaded | LoadState::Loading => Err(ResolverError::NotLoaded),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&ContactRecord> {
        self.records.get(&id).map(|e| &e.record)
    }

    pub(crate) fn by_stable_id(&self, stable_id: &StableId) -> Option<&ContactRecord> {
        self.by_stable_id.get(stable_id).and_then(|id| self.get(*id))
    }

    pub(crate) fn by_phone(&self, phone: &PhoneNumber) -> Option<&ContactRecord> {
        self.by_phone.get(phone).and_then(|id| self.get(*id))
    }

    pub(crate) fn by_group(&self, group_id: &GroupId) -> Option<&ContactRecord> {
        self.by_group.get(group_id).and_then(|id| self.get(*id))
    }

    /// Resolve any identifier: contact id, stable id, phone number or group
    /// id, in that order.
    pub(crate) fn lookup(&self, identifier: &str) -> Option<&ContactRecord> {
        if let Some(record) = ContactId::parse(identifier.trim()).and_then(|id| self.get(id)) {
            return Some(record);
        }
        if let Some(record) = StableId::new(identifier).ok().and_then(|s| self.by_stable_id(&s)) {
            return Some(record);
        }
        if let Some(record) = PhoneNumber::new(identifier).ok().and_then(|p| self.by_phone(&p)) {
            return Some(record);
        }
        GroupId::new(identifier).ok().and_then(|g| self.by_group(&g))
    }

    /// Insert or replace a record and repoint its auxiliary keys.
    ///
    /// A replaced record keeps its original sequence number. Keys the old
    /// version held are dropped only if they still point at this id.
    pub(crate) fn upsert(&mut self, record: ContactRecord) {
        let id = record.id;
        let seq = match self.records.remove(&id) {
            Some(old) => {
                self.unlink(&old.record);
                old.seq
            },
            None => {
                self.next_seq += 1;
                self.next_seq
            },
        };

        self.link(&record);
        self.records.insert(id, Entry { record, seq });
    }

    /// Drop a record and rebuild the auxiliary maps, so a key the removed
    /// record shadowed resolves to the surviving holder.
    pub(crate) fn remove(&mut self, id: ContactId) -> Option<ContactRecord> {
        let removed = self.records.remove(&id)?;
        self.regenerate();
        Some(removed.record)
    }

    /// Undo an upsert of `applied`, back to `previous` (or to absent).
    ///
    /// Skipped if the record changed since `applied` went in. The original
    /// sequence number is kept.
    pub(crate) fn restore(&mut self, applied: &ContactRecord, previous: Option<ContactRecord>) {
        if self.get(applied.id) != Some(applied) {
            return;
        }
        match previous {
            Some(record) => {
                if let Some(entry) = self.records.get_mut(&record.id) {
                    entry.record = record;
                }
            },
            None => {
                self.records.remove(&applied.id);
            },
        }
        self.regenerate();
    }

    /// Every record, oldest activity first, ties broken by index order.
    pub(crate) fn by_age(&self) -> Vec<ContactRecord> {
        let mut entries: Vec<&Entry> = self.records.values().collect();
        entries.sort_by_key(|e| (e.record.active_at.unwrap_or(0), e.seq));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    fn link(&mut self, record: &ContactRecord) {
        if let Some(stable_id) = &record.stable_id {
            self.by_stable_id.insert(stable_id.clone(), record.id);
        }
        if let Some(phone) = &record.phone_number {
            self.by_phone.insert(phone.clone(), record.id);
        }
        if let Some(group_id) = &record.group_id {
            self.by_group.insert(group_id.clone(), record.id);
        }
    }

    fn unlink(&mut self, record: &ContactRecord) {
        let id = record.id;
        if let Some(stable_id) = &record.stable_id
            && self.by_stable_id.get(stable_id) == Some(&id)
        {
            self.by_stable_id.remove(stable_id);
        }
        if let Some(phone) = &record.phone_number
            && self.by_phone.get(phone) == Some(&id)
        {
            self.by_phone.remove(phone);
        }
        if let Some(group_id) = &record.group_id
            && self.by_group.get(group_id) == Some(&id)
        {
            self.by_group.remove(group_id);
        }
    }

    fn regenerate(&mut self) {
        self.by_stable_id.clear();
        self.by_phone.clear();
        self.by_group.clear();

        let mut entries: Vec<(u64, ContactRecord)> =
            self.records.values().map(|e| (e.seq, e.record.clone())).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        for (_, record) in entries {
            self.link(&record);
        }
    }
}
