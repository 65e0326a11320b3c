// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The persistence contract between the tracker and the node's
//! transactional store.
//!
//! The store is external; the tracker only sees scopes. A
//! [`SnapshotScope`] is a stable read view, a [`TransactionScope`] adds the
//! writers and commits atomically — dropping it without calling
//! [`TransactionScope::commit`] rolls everything back. All catchpoint
//! metadata (state slots, first-stage info rows, unfinished markers, the
//! file registry) and the accounts-side surface the tracker consumes live
//! behind these traits.

pub mod memory;

use crate::{
    trie::TrieCommitter,
    types::{
        AccountHashEntry, AccountTotals, CatchpointFileRecord, CatchpointFirstStageInfo, Digest,
        EncodedBalanceRecord, EncodedKvRecord, Round, SpVerificationContext, UnfinishedCatchpoint,
    },
};
use anyhow::Result;

/// String-addressed metadata slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CatchpointStateKey {
    /// The last catchpoint label written, as a string.
    LastCatchpoint,
    /// Non-zero while a first stage is between trie commit and info record.
    WritingFirstStageInfo,
    /// The lookback in effect for the rounds committed so far.
    CatchpointLookback,
}

impl CatchpointStateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatchpointStateKey::LastCatchpoint => "lastCatchpoint",
            CatchpointStateKey::WritingFirstStageInfo => "writingFirstStageInfo",
            CatchpointStateKey::CatchpointLookback => "catchpointLookback",
        }
    }
}

/// A row iterator; every item may independently fail at the storage layer.
pub type RowIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Stable read view over the store.
pub trait SnapshotScope {
    fn read_state_u64(&self, key: CatchpointStateKey) -> Result<u64>;
    fn read_state_string(&self, key: CatchpointStateKey) -> Result<String>;

    fn select_first_stage_info(&self, round: Round) -> Result<Option<CatchpointFirstStageInfo>>;
    /// Rounds of first-stage records at or below `max_round`.
    fn select_old_first_stage_rounds(&self, max_round: Round) -> Result<Vec<Round>>;
    fn select_unfinished_catchpoints(&self) -> Result<Vec<UnfinishedCatchpoint>>;

    fn get_catchpoint_file(&self, round: Round) -> Result<Option<CatchpointFileRecord>>;
    /// Up to `want` of the oldest registered files beyond the `keep` most
    /// recent ones.
    fn oldest_catchpoint_files(&self, want: usize, keep: usize)
        -> Result<Vec<CatchpointFileRecord>>;

    /// The round the persisted account hashes were built for.
    fn accounts_hash_round(&self) -> Result<Round>;
    fn accounts_totals(&self) -> Result<AccountTotals>;
    fn sp_verification_contexts(&self) -> Result<Vec<SpVerificationContext>>;

    /// Account and resource trie digests in address order: up to
    /// `chunk_size` entries starting at entry offset `start`. Cursor-paged
    /// so a trie rebuild can interleave reads with trie writes on the same
    /// scope. Used for trie rebuilds.
    fn ordered_account_hashes(
        &self,
        start: usize,
        chunk_size: usize,
    ) -> Result<Vec<AccountHashEntry>>;
    /// Raw key-value entries, cursor-paged like `ordered_account_hashes`.
    fn kv_entries(&self, start: usize, chunk_size: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Account rows in address order, pre-encoded for the data file.
    fn balance_records(&self) -> RowIter<'_, EncodedBalanceRecord>;
    /// Key-value rows, pre-encoded for the data file.
    fn kv_records(&self) -> RowIter<'_, EncodedKvRecord>;

    /// Canonical encodings of the online-accounts history rows.
    fn online_account_rows(&self) -> RowIter<'_, Vec<u8>>;
    /// Canonical encodings of the online-round-params history rows.
    fn online_round_params_rows(&self) -> RowIter<'_, Vec<u8>>;
}

/// Read-write scope. All mutations commit or roll back together.
pub trait TransactionScope: SnapshotScope {
    fn write_state_u64(&mut self, key: CatchpointStateKey, value: u64) -> Result<()>;
    fn write_state_string(&mut self, key: CatchpointStateKey, value: &str) -> Result<()>;

    fn insert_first_stage_info(
        &mut self,
        round: Round,
        info: &CatchpointFirstStageInfo,
    ) -> Result<()>;
    fn delete_old_first_stage_info(&mut self, max_round: Round) -> Result<()>;

    fn insert_unfinished_catchpoint(&mut self, round: Round, block_hash: Digest) -> Result<()>;
    fn delete_unfinished_catchpoint(&mut self, round: Round) -> Result<()>;

    /// Registers (or, with an empty path, un-registers) a catchpoint file.
    fn store_catchpoint_file(&mut self, round: Round, rel_path: &str, size: u64) -> Result<()>;

    /// Drops all persisted account hashes, forcing the next boot to rebuild
    /// the trie from scratch.
    fn reset_account_hashes(&mut self) -> Result<()>;
    fn update_accounts_hash_round(&mut self, round: Round) -> Result<()>;

    /// The trie page store bound to this transaction.
    fn merkle_committer(&mut self) -> &mut dyn TrieCommitter;

    /// Publishes the scope's mutations. Dropping the scope instead rolls
    /// them back.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Handle to the store, handing out scopes.
pub trait TrackerStore: Send + Sync {
    fn begin_snapshot(&self) -> Result<Box<dyn SnapshotScope + '_>>;
    fn begin_transaction(&self) -> Result<Box<dyn TransactionScope + '_>>;
}

/// Runs `f` inside a transaction scope, committing on success.
pub fn with_transaction<T>(
    store: &dyn TrackerStore,
    f: impl FnOnce(&mut dyn TransactionScope) -> Result<T>,
) -> Result<T> {
    let mut tx = store.begin_transaction()?;
    let out = f(tx.as_mut())?;
    tx.commit()?;
    Ok(out)
}

/// Runs `f` against a read snapshot.
pub fn with_snapshot<T>(
    store: &dyn TrackerStore,
    f: impl FnOnce(&dyn SnapshotScope) -> Result<T>,
) -> Result<T> {
    let snapshot = store.begin_snapshot()?;
    f(snapshot.as_ref())
}
