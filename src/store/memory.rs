// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! An in-memory [`TrackerStore`] with real transaction semantics: a scope
//! works on a private copy of the state and publishes it on commit, so a
//! dropped transaction genuinely rolls back. Iterations are computed
//! eagerly; a production store streams them instead.

use crate::{
    hashes::{account_hash_builder_v6, resource_hash_builder_v6},
    store::{CatchpointStateKey, RowIter, SnapshotScope, TrackerStore, TransactionScope},
    trie::TrieCommitter,
    types::{
        AccountData, AccountHashEntry, AccountTotals, Address, CatchpointFileRecord,
        CatchpointFirstStageInfo, CompactAccountDelta, CompactResourceDelta, Digest,
        EncodedBalanceRecord, EncodedKvRecord, ModifiedKvValue, ResourceData, Round,
        SpVerificationContext, UnfinishedCatchpoint,
    },
};
use anyhow::Result;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// One account row together with its resources.
#[derive(Clone, Debug, Default)]
struct AccountRecord {
    data: AccountData,
    resources: BTreeMap<u64, ResourceData>,
}

#[derive(Clone, Default)]
struct Inner {
    state_u64: HashMap<&'static str, u64>,
    state_str: HashMap<&'static str, String>,
    first_stage_infos: BTreeMap<Round, CatchpointFirstStageInfo>,
    unfinished: BTreeMap<Round, Digest>,
    files: BTreeMap<Round, (String, u64)>,
    accounts_hash_round: Round,
    totals: AccountTotals,
    accounts: BTreeMap<Address, AccountRecord>,
    kvs: BTreeMap<Vec<u8>, Vec<u8>>,
    sp_contexts: Vec<SpVerificationContext>,
    online_account_rows: Vec<Vec<u8>>,
    online_round_params_rows: Vec<Vec<u8>>,
    trie_pages: HashMap<u64, Vec<u8>>,
}

/// Shared-handle in-memory store. Clones refer to the same state, which is
/// how tests simulate a restart: drop the tracker, keep the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_account(&self, address: Address, data: AccountData) {
        self.inner.write().accounts.entry(address).or_default().data = data;
    }

    pub fn remove_account(&self, address: &Address) {
        self.inner.write().accounts.remove(address);
    }

    pub fn set_resource(&self, address: Address, asset_index: u64, data: ResourceData) {
        self.inner
            .write()
            .accounts
            .entry(address)
            .or_default()
            .resources
            .insert(asset_index, data);
    }

    pub fn set_kv(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let mut inner = self.inner.write();
        match value {
            Some(value) => {
                inner.kvs.insert(key, value);
            }
            None => {
                inner.kvs.remove(&key);
            }
        }
    }

    pub fn set_totals(&self, totals: AccountTotals) {
        self.inner.write().totals = totals;
    }

    pub fn set_sp_contexts(&self, contexts: Vec<SpVerificationContext>) {
        self.inner.write().sp_contexts = contexts;
    }

    pub fn set_online_rows(&self, accounts: Vec<Vec<u8>>, round_params: Vec<Vec<u8>>) {
        let mut inner = self.inner.write();
        inner.online_account_rows = accounts;
        inner.online_round_params_rows = round_params;
    }

    /// Applies compacted deltas to the account / resource / kv tables the
    /// way the surrounding ledger's accounts writer would, so end-to-end
    /// tests keep the row state consistent with the trie updates.
    pub fn apply_deltas(
        &self,
        accounts: &[CompactAccountDelta],
        resources: &[CompactResourceDelta],
        kvs: &BTreeMap<Vec<u8>, ModifiedKvValue>,
    ) {
        let mut inner = self.inner.write();
        for delta in accounts {
            if delta.new.is_empty() {
                inner.accounts.remove(&delta.address);
            } else {
                inner.accounts.entry(delta.address).or_default().data = delta.new.clone();
            }
        }
        for delta in resources {
            let entry = inner.accounts.entry(delta.address).or_default();
            if delta.new.is_empty() {
                entry.resources.remove(&delta.asset_index);
            } else {
                entry.resources.insert(delta.asset_index, delta.new.clone());
            }
        }
        for (key, modified) in kvs {
            match &modified.new {
                Some(value) => {
                    inner.kvs.insert(key.clone(), value.clone());
                }
                None => {
                    inner.kvs.remove(key);
                }
            }
        }
    }
}

impl TrackerStore for MemoryStore {
    fn begin_snapshot(&self) -> Result<Box<dyn SnapshotScope + '_>> {
        Ok(Box::new(MemoryScope {
            store: self,
            work: self.inner.read().clone(),
        }))
    }

    fn begin_transaction(&self) -> Result<Box<dyn TransactionScope + '_>> {
        Ok(Box::new(MemoryScope {
            store: self,
            work: self.inner.read().clone(),
        }))
    }
}

struct MemoryScope<'a> {
    store: &'a MemoryStore,
    work: Inner,
}

impl MemoryScope<'_> {
    fn hash_entries(&self) -> Vec<AccountHashEntry> {
        let mut entries = Vec::new();
        for (address, record) in &self.work.accounts {
            if !record.data.is_empty() {
                entries.push(AccountHashEntry {
                    digest: account_hash_builder_v6(address, &record.data, &record.data.encoded()),
                    address: *address,
                });
            }
            for (asset_index, resource) in &record.resources {
                if resource.is_empty() {
                    continue;
                }
                let digest = resource_hash_builder_v6(
                    resource,
                    address,
                    *asset_index,
                    resource.update_round,
                    &resource.encoded(),
                )
                .expect("resource hash of a well-formed record");
                entries.push(AccountHashEntry {
                    digest,
                    address: *address,
                });
            }
        }
        entries
    }
}

impl SnapshotScope for MemoryScope<'_> {
    fn read_state_u64(&self, key: CatchpointStateKey) -> Result<u64> {
        Ok(self.work.state_u64.get(key.as_str()).copied().unwrap_or(0))
    }

    fn read_state_string(&self, key: CatchpointStateKey) -> Result<String> {
        Ok(self
            .work
            .state_str
            .get(key.as_str())
            .cloned()
            .unwrap_or_default())
    }

    fn select_first_stage_info(&self, round: Round) -> Result<Option<CatchpointFirstStageInfo>> {
        Ok(self.work.first_stage_infos.get(&round).cloned())
    }

    fn select_old_first_stage_rounds(&self, max_round: Round) -> Result<Vec<Round>> {
        Ok(self
            .work
            .first_stage_infos
            .range(..=max_round)
            .map(|(round, _)| *round)
            .collect())
    }

    fn select_unfinished_catchpoints(&self) -> Result<Vec<UnfinishedCatchpoint>> {
        Ok(self
            .work
            .unfinished
            .iter()
            .map(|(round, block_hash)| UnfinishedCatchpoint {
                round: *round,
                block_hash: *block_hash,
            })
            .collect())
    }

    fn get_catchpoint_file(&self, round: Round) -> Result<Option<CatchpointFileRecord>> {
        Ok(self
            .work
            .files
            .get(&round)
            .map(|(rel_path, size)| CatchpointFileRecord {
                round,
                rel_path: rel_path.clone(),
                size: *size,
            }))
    }

    fn oldest_catchpoint_files(
        &self,
        want: usize,
        keep: usize,
    ) -> Result<Vec<CatchpointFileRecord>> {
        let total = self.work.files.len();
        let beyond = total.saturating_sub(keep);
        Ok(self
            .work
            .files
            .iter()
            .take(beyond.min(want))
            .map(|(round, (rel_path, size))| CatchpointFileRecord {
                round: *round,
                rel_path: rel_path.clone(),
                size: *size,
            })
            .collect())
    }

    fn accounts_hash_round(&self) -> Result<Round> {
        Ok(self.work.accounts_hash_round)
    }

    fn accounts_totals(&self) -> Result<AccountTotals> {
        Ok(self.work.totals)
    }

    fn sp_verification_contexts(&self) -> Result<Vec<SpVerificationContext>> {
        Ok(self.work.sp_contexts.clone())
    }

    fn ordered_account_hashes(
        &self,
        start: usize,
        chunk_size: usize,
    ) -> Result<Vec<AccountHashEntry>> {
        Ok(self
            .hash_entries()
            .into_iter()
            .skip(start)
            .take(chunk_size)
            .collect())
    }

    fn kv_entries(&self, start: usize, chunk_size: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .work
            .kvs
            .iter()
            .skip(start)
            .take(chunk_size)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn balance_records(&self) -> RowIter<'_, EncodedBalanceRecord> {
        Box::new(self.work.accounts.iter().filter_map(|(address, record)| {
            if record.data.is_empty() {
                return None;
            }
            Some(Ok(EncodedBalanceRecord {
                address: *address,
                account_data: record.data.encoded(),
            }))
        }))
    }

    fn kv_records(&self) -> RowIter<'_, EncodedKvRecord> {
        Box::new(self.work.kvs.iter().map(|(key, value)| {
            Ok(EncodedKvRecord {
                key: key.clone(),
                value: value.clone(),
            })
        }))
    }

    fn online_account_rows(&self) -> RowIter<'_, Vec<u8>> {
        Box::new(self.work.online_account_rows.iter().cloned().map(Ok))
    }

    fn online_round_params_rows(&self) -> RowIter<'_, Vec<u8>> {
        Box::new(self.work.online_round_params_rows.iter().cloned().map(Ok))
    }
}

impl TransactionScope for MemoryScope<'_> {
    fn write_state_u64(&mut self, key: CatchpointStateKey, value: u64) -> Result<()> {
        self.work.state_u64.insert(key.as_str(), value);
        Ok(())
    }

    fn write_state_string(&mut self, key: CatchpointStateKey, value: &str) -> Result<()> {
        self.work.state_str.insert(key.as_str(), value.to_string());
        Ok(())
    }

    fn insert_first_stage_info(
        &mut self,
        round: Round,
        info: &CatchpointFirstStageInfo,
    ) -> Result<()> {
        self.work.first_stage_infos.insert(round, info.clone());
        Ok(())
    }

    fn delete_old_first_stage_info(&mut self, max_round: Round) -> Result<()> {
        self.work.first_stage_infos = self.work.first_stage_infos.split_off(&(max_round + 1));
        Ok(())
    }

    fn insert_unfinished_catchpoint(&mut self, round: Round, block_hash: Digest) -> Result<()> {
        self.work.unfinished.insert(round, block_hash);
        Ok(())
    }

    fn delete_unfinished_catchpoint(&mut self, round: Round) -> Result<()> {
        self.work.unfinished.remove(&round);
        Ok(())
    }

    fn store_catchpoint_file(&mut self, round: Round, rel_path: &str, size: u64) -> Result<()> {
        if rel_path.is_empty() {
            self.work.files.remove(&round);
        } else {
            self.work.files.insert(round, (rel_path.to_string(), size));
        }
        Ok(())
    }

    fn reset_account_hashes(&mut self) -> Result<()> {
        self.work.trie_pages.clear();
        Ok(())
    }

    fn update_accounts_hash_round(&mut self, round: Round) -> Result<()> {
        self.work.accounts_hash_round = round;
        Ok(())
    }

    fn merkle_committer(&mut self) -> &mut dyn TrieCommitter {
        self
    }

    fn commit(self: Box<Self>) -> Result<()> {
        *self.store.inner.write() = self.work;
        Ok(())
    }
}

impl TrieCommitter for MemoryScope<'_> {
    fn store_page(&mut self, page: u64, content: &[u8]) -> Result<()> {
        self.work.trie_pages.insert(page, content.to_vec());
        Ok(())
    }

    fn load_page(&mut self, page: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.work.trie_pages.get(&page).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::with_transaction;

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin_transaction().unwrap();
            tx.write_state_u64(CatchpointStateKey::CatchpointLookback, 320)
                .unwrap();
            // dropped without commit
        }
        let snapshot = store.begin_snapshot().unwrap();
        assert_eq!(
            snapshot
                .read_state_u64(CatchpointStateKey::CatchpointLookback)
                .unwrap(),
            0
        );
    }

    #[test]
    fn committed_transaction_publishes() {
        let store = MemoryStore::new();
        with_transaction(&store, |tx| {
            tx.write_state_string(CatchpointStateKey::LastCatchpoint, "100#ABC")?;
            tx.insert_unfinished_catchpoint(100, Digest([1u8; 32]))
        })
        .unwrap();

        let snapshot = store.begin_snapshot().unwrap();
        assert_eq!(
            snapshot
                .read_state_string(CatchpointStateKey::LastCatchpoint)
                .unwrap(),
            "100#ABC"
        );
        assert_eq!(snapshot.select_unfinished_catchpoints().unwrap().len(), 1);
    }

    #[test]
    fn oldest_files_respects_keep() {
        let store = MemoryStore::new();
        with_transaction(&store, |tx| {
            for round in [100u64, 200, 300, 400] {
                tx.store_catchpoint_file(round, &format!("catchpoints/{}", round), 10)?;
            }
            Ok(())
        })
        .unwrap();

        let snapshot = store.begin_snapshot().unwrap();
        let oldest = snapshot.oldest_catchpoint_files(2, 3).unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].round, 100);

        let oldest = snapshot.oldest_catchpoint_files(2, 1).unwrap();
        assert_eq!(oldest.len(), 2);
        assert_eq!(oldest[0].round, 100);
        assert_eq!(oldest[1].round, 200);
    }

    #[test]
    fn snapshot_is_stable_against_later_writes() {
        let store = MemoryStore::new();
        store.set_kv(b"k".to_vec(), Some(b"v1".to_vec()));
        let snapshot = store.begin_snapshot().unwrap();
        store.set_kv(b"k".to_vec(), Some(b"v2".to_vec()));
        let rows: Vec<_> = snapshot.kv_records().collect::<Result<_>>().unwrap();
        assert_eq!(rows[0].value, b"v1".to_vec());
    }
}
