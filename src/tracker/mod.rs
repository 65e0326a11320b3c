// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The catchpoint tracker: keeps the balances trie in sync with every
//! committed round and drives the two-stage catchpoint pipeline.
//!
//! Stage 1 runs when the accounts round `A = R - lookback` becomes the
//! committed base: the trie is committed, the data file is streamed out
//! under backpressure from live commits, and a first-stage info record is
//! persisted. Stage 2 runs when the block round `R` commits: the label is
//! derived from the then-known block digest and the data file is repacked
//! into the final archive. A restart between the stages (or inside either)
//! is healed at boot from the persistent markers.

#[cfg(test)]
mod tests;

use crate::{
    errors::CatchpointError,
    file_writer::{CatchpointFileWriter, FileWriterStats},
    hashes::{
        account_hash_builder_v6, encode_and_hash_sp_contexts, kv_hash_builder_v6,
        resource_hash_builder_v6, verification_hash,
    },
    label::{make_label, CatchpointLabelMaker},
    metrics, repack,
    scheduler::{calculate_catchpoint_rounds, calculate_first_stage_rounds},
    store::{
        with_snapshot, with_transaction, CatchpointStateKey, TrackerStore, TransactionScope,
    },
    trie::{BalancesTrie, TrieCommitter, TrieFactory},
    types::{
        BlockHeader, CatchpointFileHeader, CatchpointFirstStageInfo, CompactAccountDelta,
        CompactResourceDelta, ConsensusRegistry, ConsensusVersion, Digest, ModifiedKvValue, Round,
    },
    utils::{
        make_catchpoint_data_file_path, make_catchpoint_file_path,
        remove_single_catchpoint_file_from_disk, CancelToken, SlowWritingSignal,
        CATCHPOINT_DIR_NAME,
    },
};
use anyhow::{ensure, Context, Result};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{ErrorKind, Read},
    path::PathBuf,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Catchpoint file version matching the V0-V5 database schemas.
pub const CATCHPOINT_FILE_VERSION_V5: u64 = 0o200;
/// Catchpoint file version that separated accounts and resources.
pub const CATCHPOINT_FILE_VERSION_V6: u64 = 0o201;
/// Catchpoint file version that added state proof verification contexts.
pub const CATCHPOINT_FILE_VERSION_V7: u64 = 0o202;
/// Catchpoint file version that added online accounts and round params
/// verification hashes.
pub const CATCHPOINT_FILE_VERSION_V8: u64 = 0o203;

/// Accounts read per cursor page while rebuilding the trie.
const TRIE_REBUILD_ACCOUNT_CHUNK_SIZE: usize = 16_384;
/// Insertions between evict-with-flush calls during a rebuild, bounding the
/// trie's memory while the transaction stays open.
const TRIE_REBUILD_COMMIT_FREQUENCY: usize = 65_536;

/// Records per `balances.<n>.msgpack` chunk.
pub const RESOURCES_PER_CATCHPOINT_FILE_CHUNK: usize = 512;

const SHORT_CHUNK_EXECUTION_DURATION: Duration = Duration::from_millis(50);
const LONG_CHUNK_EXECUTION_DURATION: Duration = Duration::from_secs(1);
const CHUNK_SLEEP_INTERVAL: Duration = Duration::from_millis(100);
const REBUILD_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// What the tracker needs from the surrounding ledger at boot time.
pub trait LedgerForTracker {
    fn block_hdr(&self, round: Round) -> Result<BlockHeader>;
}

/// Explicit tracker configuration; there are no process-wide knobs.
#[derive(Clone, Debug)]
pub struct CatchpointTrackerConfig {
    /// Hot directory holding first-stage intermediates.
    pub tmp_dir: PathBuf,
    /// Cold directory holding finished catchpoint archives.
    pub db_directory: PathBuf,
    /// Rounds between catchpoints; zero disables the tracker entirely.
    pub catchpoint_interval: u64,
    /// How many finished archives to retain: 0 keeps none, -1 keeps all,
    /// a positive n keeps the n most recent.
    pub catchpoint_file_history_length: i64,
    /// Whether to produce catchpoint files in addition to labels.
    pub enable_generating_catchpoint_files: bool,
    /// Debug mode: generate files even before the re-enable round is known.
    pub force_catchpoint_file_writing: bool,
}

/// The committed-round window the ledger is about to flush, as narrowed and
/// annotated by [`CatchpointTracker::produce_committing_task`].
#[derive(Clone, Debug, Default)]
pub struct DeferredCommitRange {
    pub old_base: Round,
    pub offset: u64,
    pub catchpoint_lookback: u64,
    pub catchpoint_first_stage: bool,
    pub catchpoint_second_stage: bool,
    pub enable_generating_catchpoint_files: bool,
}

/// Everything the commit phases carry for one flush of deltas.
#[derive(Clone, Debug, Default)]
pub struct DeferredCommitContext {
    pub range: DeferredCommitRange,
    pub committed_round_digests: Vec<Digest>,
    pub committed_consensus_versions: Vec<ConsensusVersion>,
    pub compact_account_deltas: Vec<CompactAccountDelta>,
    pub compact_resources_deltas: Vec<CompactResourceDelta>,
    pub compact_kv_deltas: BTreeMap<Vec<u8>, ModifiedKvValue>,
    pub flush_time: Option<Instant>,
    pub updating_balances_duration: Duration,
}

impl DeferredCommitContext {
    pub fn new(range: DeferredCommitRange) -> Self {
        DeferredCommitContext {
            range,
            ..Default::default()
        }
    }

    pub fn new_base(&self) -> Round {
        self.range.old_base + self.range.offset
    }
}

/// A sized reader over a finished catchpoint archive.
#[derive(Debug)]
pub struct CatchpointStream {
    file: File,
    size: i64,
}

impl CatchpointStream {
    fn new(file: File, size: i64) -> Self {
        CatchpointStream { file, size }
    }

    /// The registered file size, or -1 when unknown.
    pub fn size(&self) -> i64 {
        self.size
    }
}

impl Read for CatchpointStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

struct SharedState {
    /// Block digest for every round past the committed base, in order.
    round_digest: Vec<Digest>,
    /// Consensus version for every round past the committed base.
    consensus_version: Vec<ConsensusVersion>,
    /// The trie over the committed balances. `None` after an error; the
    /// next commit re-creates it from the persisted pages.
    balances_trie: Option<Box<dyn BalancesTrie>>,
    /// The committed base round, cached for lookups.
    cached_db_round: Round,
    last_catchpoint_label: String,
    /// First round at which catchpoint generation is allowed, once the
    /// enabling consensus upgrade has been observed. Zero until then.
    reenable_catchpoints_round: Round,
    /// Pacing signal for the stage-1 writer; replaced per attempt.
    slow_writing: Arc<SlowWritingSignal>,
}

/// The catchpoint tracker. All public operations take `&self`; the ledger
/// serializes the commit path, everything else synchronizes internally.
pub struct CatchpointTracker {
    tmp_dir: PathBuf,
    db_directory: PathBuf,
    catchpoint_interval: u64,
    catchpoint_file_history_length: i64,
    enable_generating_catchpoint_files: bool,
    force_catchpoint_file_writing: bool,
    store: Arc<dyn TrackerStore>,
    consensus: ConsensusRegistry,
    trie_factory: TrieFactory,
    shared: RwLock<SharedState>,
    /// Zero when no first-stage data file is being written; -1 while one is
    /// in flight. Acts as a non-blocking mutex over stage-1 writing.
    data_writing: AtomicI32,
    cancel: CancelToken,
}

impl CatchpointTracker {
    pub fn new(
        config: CatchpointTrackerConfig,
        store: Arc<dyn TrackerStore>,
        consensus: ConsensusRegistry,
        trie_factory: TrieFactory,
    ) -> Self {
        let mut history_length = config.catchpoint_file_history_length;
        if history_length < -1 {
            history_length = -1;
        }
        let mut enable_files = config.enable_generating_catchpoint_files;
        if config.force_catchpoint_file_writing && config.catchpoint_interval > 0 {
            enable_files = true;
        }
        CatchpointTracker {
            tmp_dir: config.tmp_dir,
            db_directory: config.db_directory,
            catchpoint_interval: config.catchpoint_interval,
            catchpoint_file_history_length: history_length,
            enable_generating_catchpoint_files: enable_files,
            force_catchpoint_file_writing: config.force_catchpoint_file_writing,
            store,
            consensus,
            trie_factory,
            shared: RwLock::new(SharedState {
                round_digest: Vec::new(),
                consensus_version: Vec::new(),
                balances_trie: None,
                cached_db_round: 0,
                last_catchpoint_label: String::new(),
                reenable_catchpoints_round: 0,
                slow_writing: SlowWritingSignal::new_closed(),
            }),
            data_writing: AtomicI32::new(0),
            cancel: CancelToken::new(),
        }
    }

    fn catchpoint_enabled(&self) -> bool {
        self.catchpoint_interval != 0
    }

    /// True iff a first-stage data file is being generated (or scheduled).
    pub fn is_writing_catchpoint_data_file(&self) -> bool {
        self.data_writing.load(Ordering::SeqCst) != 0
    }

    /// The last catchpoint label written to the store.
    pub fn last_catchpoint_label(&self) -> String {
        self.shared.read().last_catchpoint_label.clone()
    }

    /// Loads tracker state from the store at the committed base round and
    /// heals any interrupted catchpoint work.
    pub fn load_from_disk(&self, ledger: &dyn LedgerForTracker, db_round: Round) -> Result<()> {
        {
            let mut shared = self.shared.write();
            shared.cached_db_round = db_round;
            shared.round_digest.clear();
            shared.consensus_version.clear();
            shared.balances_trie = None;
            // No writer should linger from a previous life.
            shared.slow_writing = SlowWritingSignal::new_closed();
        }
        self.data_writing.store(0, Ordering::SeqCst);

        with_transaction(&*self.store, |tx| self.initialize_hashes(tx, db_round))?;

        let label = with_snapshot(&*self.store, |snapshot| {
            snapshot.read_state_string(CatchpointStateKey::LastCatchpoint)
        })?;
        self.shared.write().last_catchpoint_label = label;

        let hdr = ledger
            .block_hdr(db_round)
            .with_context(|| format!("reading block header for round {}", db_round))?;
        self.recover_from_crash(db_round, &hdr.consensus_version)
    }

    /// Informs the tracker of a new block. The digest and consensus version
    /// are retained until the round is committed.
    pub fn new_block(&self, hdr: &BlockHeader) {
        let mut shared = self.shared.write();
        shared.round_digest.push(hdr.digest);
        shared.consensus_version.push(hdr.consensus_version.clone());

        let params = self.consensus.params(&hdr.consensus_version);
        if (params.enable_catchpoints_with_sp_contexts || self.force_catchpoint_file_writing)
            && shared.reenable_catchpoints_round == 0
        {
            let mut lookback = params.catchpoint_lookback;
            if lookback == 0 {
                lookback = params.max_bal_lookback;
            }
            shared.reenable_catchpoints_round = hdr.round + lookback;
        }
    }

    /// Reports the oldest round the block store must retain for this
    /// tracker, and the lookback it maintains.
    pub fn committed_up_to(&self, _rnd: Round) -> (Round, Round) {
        (self.shared.read().cached_db_round, 0)
    }

    /// Inspects (and possibly narrows) a commit window. Returns `None` when
    /// the previous stage-1 writer must finish before the window is valid;
    /// the writer is told to hurry in that case.
    pub fn produce_committing_task(
        &self,
        _committed_round: Round,
        _db_round: Round,
        mut dcr: DeferredCommitRange,
    ) -> Option<DeferredCommitRange> {
        if self.catchpoint_interval == 0 {
            return Some(dcr);
        }

        let reenable_catchpoints_round = self.shared.read().reenable_catchpoints_round;

        let (has_first_stage_round, has_multiple_first_stage_rounds, new_offset) =
            calculate_first_stage_rounds(
                dcr.old_base,
                dcr.offset,
                reenable_catchpoints_round,
                self.catchpoint_interval,
                dcr.catchpoint_lookback,
            );
        dcr.offset = new_offset;

        if self.is_writing_catchpoint_data_file() {
            // Still writing the previous data file; if the new range holds
            // another stage-1 round, tell the pending writer to hurry.
            if has_first_stage_round {
                self.shared.read().slow_writing.close();
            }
            return None;
        }

        if has_first_stage_round {
            dcr.catchpoint_first_stage = true;
            if self.enable_generating_catchpoint_files {
                let mut shared = self.shared.write();
                shared.slow_writing = SlowWritingSignal::new();
                if has_multiple_first_stage_rounds {
                    // Skipping intermediate anchors; no reason to linger.
                    shared.slow_writing.close();
                }
            }
        }

        dcr.enable_generating_catchpoint_files = self.enable_generating_catchpoint_files;
        dcr.catchpoint_second_stage = !self.catchpoint_rounds_in_range(&dcr).is_empty();

        Some(dcr)
    }

    /// Snapshots the per-round digests and versions for the range and, for
    /// a stage-1 window, claims the writing sentinel.
    pub fn prepare_commit(&self, dcc: &mut DeferredCommitContext) -> Result<()> {
        let shared = self.shared.read();

        if self.enable_generating_catchpoint_files && dcc.range.catchpoint_first_stage {
            self.data_writing.store(-1, Ordering::SeqCst);
        }

        let offset = dcc.range.offset as usize;
        ensure!(
            offset <= shared.round_digest.len(),
            CatchpointError::UnorderedCommit {
                old_base: dcc.range.old_base,
                offset: dcc.range.offset,
            }
        );
        dcc.committed_round_digests = shared.round_digest[..offset].to_vec();
        dcc.committed_consensus_versions = shared.consensus_version[..offset].to_vec();
        Ok(())
    }

    /// Applies the range's deltas to the trie and records the catchpoint
    /// bookkeeping, all inside the caller's store transaction.
    pub fn commit_round(
        &self,
        tx: &mut dyn TransactionScope,
        dcc: &DeferredCommitContext,
    ) -> Result<()> {
        let result = self.commit_round_inner(tx, dcc);
        if result.is_err()
            && dcc.range.catchpoint_first_stage
            && self.enable_generating_catchpoint_files
        {
            self.data_writing.store(0, Ordering::SeqCst);
        }
        result
    }

    fn commit_round_inner(
        &self,
        tx: &mut dyn TransactionScope,
        dcc: &DeferredCommitContext,
    ) -> Result<()> {
        let mut tree_target_round: Round = 0;

        if self.catchpoint_enabled() {
            // The trie leaves the shared state for the duration of the
            // commit; an error path drops it, and the next attempt
            // reconstructs it from the persisted pages.
            let mut trie = self
                .shared
                .write()
                .balances_trie
                .take()
                .unwrap_or_else(|| (self.trie_factory)());

            self.accounts_update_balances(trie.as_mut(), tx.merkle_committer(), dcc)?;
            self.shared.write().balances_trie = Some(trie);

            tree_target_round = dcc.range.old_base + dcc.range.offset;
        }

        tx.update_accounts_hash_round(tree_target_round)?;

        if dcc.range.catchpoint_first_stage {
            tx.write_state_u64(CatchpointStateKey::WritingFirstStageInfo, 1)?;
        }
        tx.write_state_u64(
            CatchpointStateKey::CatchpointLookback,
            dcc.range.catchpoint_lookback,
        )?;

        for round in self.catchpoint_rounds_in_range(&dcc.range) {
            let index = (round - dcc.range.old_base - 1) as usize;
            tx.insert_unfinished_catchpoint(round, dcc.committed_round_digests[index])?;
        }

        Ok(())
    }

    /// Trims the in-memory windows and lets the trie shed its clean cache.
    pub fn post_commit(&self, dcc: &mut DeferredCommitContext) {
        {
            let mut shared = self.shared.write();
            if let Some(trie) = shared.balances_trie.as_mut() {
                if let Err(err) = trie.evict(None) {
                    warn!(error = %err, "merkle trie failed to evict");
                }
            }
            let offset = (dcc.range.offset as usize).min(shared.round_digest.len());
            shared.round_digest.drain(..offset);
            shared.consensus_version.drain(..offset);
            shared.cached_db_round = dcc.new_base();
        }
        dcc.updating_balances_duration = dcc
            .flush_time
            .map(|flush_time| flush_time.elapsed())
            .unwrap_or_default();
    }

    /// Runs the long tail of the commit outside any lock: finishes the
    /// first stage (data file + info record), finishes every catchpoint
    /// whose block round fell in the range, and prunes expired first-stage
    /// artifacts. Failures here cost the affected catchpoint, never
    /// correctness; the next boot retries what the markers still describe.
    pub fn post_commit_unlocked(&self, dcc: &DeferredCommitContext) {
        if dcc.range.catchpoint_first_stage {
            let round = dcc.new_base();
            let index = (round - dcc.range.old_base - 1) as usize;
            let block_proto = dcc.committed_consensus_versions[index].clone();
            if let Err(err) =
                self.finish_first_stage(round, &block_proto, dcc.updating_balances_duration)
            {
                warn!(new_base = round, error = %err, "error finishing catchpoint's first stage");
            }
        }

        // Catchpoints for block rounds in (old_base, new_base].
        for round in self.catchpoint_rounds_in_range(&dcc.range) {
            let index = (round - dcc.range.old_base - 1) as usize;
            let block_hash = dcc.committed_round_digests[index];
            let block_proto = dcc.committed_consensus_versions[index].clone();
            if let Err(err) = self.finish_catchpoint(
                round,
                block_hash,
                &block_proto,
                dcc.range.catchpoint_lookback,
            ) {
                warn!(round, error = %err, "error creating catchpoint");
            }
        }

        if dcc.new_base() >= dcc.range.catchpoint_lookback {
            let max_round_to_delete = dcc.new_base() - dcc.range.catchpoint_lookback;
            if let Err(err) = self.prune_first_stage_records(max_round_to_delete) {
                warn!(new_base = dcc.new_base(), error = %err,
                    "error pruning first stage records and data");
            }
        }
    }

    /// An out-of-order commit cancels the write path.
    pub fn handle_unordered_commit(&self, dcc: &DeferredCommitContext) {
        self.cancel_write(dcc);
    }

    /// A commit-preparation error cancels the write path.
    pub fn handle_prepare_commit_error(&self, dcc: &DeferredCommitContext) {
        self.cancel_write(dcc);
    }

    /// A commit error leaves the trie cache in an unknown state: drop it so
    /// the next round rebuilds from the persisted pages, and cancel the
    /// write path.
    pub fn handle_commit_error(&self, dcc: &DeferredCommitContext) {
        self.shared.write().balances_trie = None;
        self.cancel_write(dcc);
    }

    /// Between commit retries, drop the in-memory trie changes made by the
    /// failed attempt.
    pub fn clear_commit_round_retry(&self, dcc: &DeferredCommitContext) {
        info!(
            old_base = dcc.range.old_base,
            offset = dcc.range.offset,
            "rolling back failed commit round, clearing balances trie"
        );
        self.shared.write().balances_trie = None;
    }

    fn cancel_write(&self, dcc: &DeferredCommitContext) {
        if self.enable_generating_catchpoint_files && dcc.range.catchpoint_first_stage {
            self.data_writing.store(0, Ordering::SeqCst);
        }
    }

    /// Terminates the tracker; in-flight writers abort at their next step.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn catchpoint_rounds_in_range(&self, dcr: &DeferredCommitRange) -> Vec<Round> {
        if self.catchpoint_interval == 0 {
            return Vec::new();
        }
        let mut min = dcr.old_base + 1;
        if dcr.catchpoint_lookback + 1 > min {
            min = dcr.catchpoint_lookback + 1;
        }
        let max = dcr.old_base + dcr.offset;
        calculate_catchpoint_rounds(min, max, self.catchpoint_interval)
    }

    /// Applies the compacted account / resource / key-value deltas to the
    /// trie: delete the old hash when the old value was non-empty, add the
    /// new hash when the new value is non-empty. A `false` add or delete
    /// indicates drift between the trie and the rows; it is logged and the
    /// commit proceeds.
    fn accounts_update_balances(
        &self,
        trie: &mut dyn BalancesTrie,
        committer: &mut dyn TrieCommitter,
        dcc: &DeferredCommitContext,
    ) -> Result<()> {
        if !self.catchpoint_enabled() {
            return Ok(());
        }
        let mut accumulated_changes = 0usize;

        for delta in &dcc.compact_account_deltas {
            if !delta.old.is_empty() {
                let delete_hash =
                    account_hash_builder_v6(&delta.address, &delta.old, &delta.old.encoded());
                let deleted = trie.delete(committer, &delete_hash).with_context(|| {
                    format!("failed to delete hash '{}' from merkle trie", delete_hash)
                })?;
                if !deleted {
                    warn!(hash = %delete_hash, "failed to delete account hash from merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
            if !delta.new.is_empty() {
                let add_hash =
                    account_hash_builder_v6(&delta.address, &delta.new, &delta.new.encoded());
                let added = trie.add(committer, &add_hash).with_context(|| {
                    format!("attempted to add hash '{}' to merkle trie", add_hash)
                })?;
                if !added {
                    warn!(hash = %add_hash, "attempted to add duplicate account hash to merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
        }

        for delta in &dcc.compact_resources_deltas {
            if !delta.old.is_empty() {
                let delete_hash = resource_hash_builder_v6(
                    &delta.old,
                    &delta.address,
                    delta.asset_index,
                    delta.old.update_round,
                    &delta.old.encoded(),
                )?;
                let deleted = trie.delete(committer, &delete_hash).with_context(|| {
                    format!("failed to delete resource hash '{}' from merkle trie", delete_hash)
                })?;
                if !deleted {
                    warn!(hash = %delete_hash, "failed to delete resource hash from merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
            if !delta.new.is_empty() {
                let add_hash = resource_hash_builder_v6(
                    &delta.new,
                    &delta.address,
                    delta.asset_index,
                    delta.new.update_round,
                    &delta.new.encoded(),
                )?;
                let added = trie.add(committer, &add_hash).with_context(|| {
                    format!("attempted to add resource hash '{}' to merkle trie", add_hash)
                })?;
                if !added {
                    warn!(hash = %add_hash, "attempted to add duplicate resource hash to merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
        }

        for (key, modified) in &dcc.compact_kv_deltas {
            let (old_data, new_data) = (&modified.old, &modified.new);
            if old_data.is_none() && new_data.is_none() {
                // Came and went within the delta span.
                continue;
            }
            if let Some(old_value) = old_data {
                if let Some(new_value) = new_data {
                    if old_value == new_value {
                        // Changed back within the delta span.
                        continue;
                    }
                }
                let delete_hash = kv_hash_builder_v6(key, old_value);
                let deleted = trie.delete(committer, &delete_hash).with_context(|| {
                    format!("failed to delete kv hash '{}' from merkle trie", delete_hash)
                })?;
                if !deleted {
                    warn!(hash = %delete_hash, "failed to delete kv hash from merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
            if let Some(new_value) = new_data {
                let add_hash = kv_hash_builder_v6(key, new_value);
                let added = trie.add(committer, &add_hash).with_context(|| {
                    format!("attempted to add kv hash '{}' to merkle trie", add_hash)
                })?;
                if !added {
                    warn!(hash = %add_hash, "attempted to add duplicate kv hash to merkle trie");
                } else {
                    accumulated_changes += 1;
                }
            }
        }

        if accumulated_changes > 0 {
            let stats = trie.commit(committer)?;
            let root = trie.root_hash(committer)?;
            debug!(
                root = %root,
                old_base = dcc.range.old_base,
                new_base = dcc.new_base(),
                pages_written = stats.pages_written,
                entry_count = stats.entry_count,
                "balances trie committed"
            );
        }
        Ok(())
    }

    /// Completes a first stage for the committed base round: version-gated
    /// verification hashes, the data file, and the persistent info record.
    fn finish_first_stage(
        &self,
        db_round: Round,
        block_proto: &ConsensusVersion,
        updating_balances_duration: Duration,
    ) -> Result<()> {
        info!(db_round, "finishing catchpoint's first stage");

        let params = self.consensus.params(block_proto);

        let mut sp_verification_encoded: Option<Vec<u8>> = None;
        let mut sp_verification_hash = Digest::ZERO;
        if params.enable_catchpoints_with_sp_contexts {
            let (encoded, hash) = with_snapshot(&*self.store, |snapshot| {
                Ok(encode_and_hash_sp_contexts(
                    &snapshot.sp_verification_contexts()?,
                ))
            })?;
            sp_verification_encoded = Some(encoded);
            sp_verification_hash = hash;
        }

        let mut online_accounts_hash = Digest::ZERO;
        let mut online_round_params_hash = Digest::ZERO;
        let mut total_online_accounts = 0u64;
        let mut total_online_round_params = 0u64;
        if params.enable_catchpoints_with_online_accounts {
            (
                online_accounts_hash,
                total_online_accounts,
                online_round_params_hash,
                total_online_round_params,
            ) = with_snapshot(&*self.store, |snapshot| {
                let (accounts_hash, accounts_count) =
                    verification_hash(b"onlineaccounts", snapshot.online_account_rows())?;
                let (params_hash, params_count) =
                    verification_hash(b"onlineroundparams", snapshot.online_round_params_rows())?;
                Ok((accounts_hash, accounts_count, params_hash, params_count))
            })?;
        }

        let mut file_stats = FileWriterStats::default();
        if self.enable_generating_catchpoint_files {
            // Generated inline so no new account writes overlap the
            // snapshot; the writer yields between chunks instead.
            let generated =
                self.generate_catchpoint_data(db_round, sp_verification_encoded.as_deref());
            self.data_writing.store(0, Ordering::SeqCst);
            file_stats = generated?;
        }

        with_transaction(&*self.store, |tx| {
            self.record_first_stage_info(
                tx,
                db_round,
                &file_stats,
                total_online_accounts,
                total_online_round_params,
                sp_verification_hash,
                online_accounts_hash,
                online_round_params_hash,
                updating_balances_duration,
            )?;
            // Clear the crash marker in the same transaction.
            tx.write_state_u64(CatchpointStateKey::WritingFirstStageInfo, 0)
        })
    }

    /// Streams the data file for `accounts_round`, pacing itself by the
    /// slow-writing signal: sleeps between chunks and a ramping per-chunk
    /// deadline while open, the long deadline and no sleeps once closed.
    fn generate_catchpoint_data(
        &self,
        accounts_round: Round,
        sp_verification_encoded: Option<&[u8]>,
    ) -> Result<FileWriterStats> {
        debug!(accounts_round, "writing catchpoint data file");

        let data_file_path = self
            .tmp_dir
            .join(CATCHPOINT_DIR_NAME)
            .join(make_catchpoint_data_file_path(accounts_round));

        let slow_writing = self.shared.read().slow_writing.clone();
        let mut chunk_execution_duration = if slow_writing.is_closed() {
            LONG_CHUNK_EXECUTION_DURATION
        } else {
            SHORT_CHUNK_EXECUTION_DURATION
        };

        let snapshot = self.store.begin_snapshot()?;
        let mut writer = CatchpointFileWriter::new(
            &data_file_path,
            snapshot.as_ref(),
            RESOURCES_PER_CATCHPOINT_FILE_CHUNK,
        )?;
        if let Some(encoded) = sp_verification_encoded {
            if let Err(err) = writer.write_sp_verification_context(encoded) {
                if let Err(abort_err) = writer.abort() {
                    warn!(error = %abort_err, "error removing catchpoint data file");
                }
                return Err(err);
            }
        }

        loop {
            let deadline = Instant::now() + chunk_execution_duration;
            match writer.write_step(deadline, &self.cancel) {
                Ok(false) => break,
                Ok(true) => {
                    if slow_writing.wait_for(CHUNK_SLEEP_INTERVAL) {
                        chunk_execution_duration = LONG_CHUNK_EXECUTION_DURATION;
                    } else {
                        // Ramp up the write slot while leaving cpu for the
                        // foreground commits.
                        chunk_execution_duration = (chunk_execution_duration * 2)
                            .min(LONG_CHUNK_EXECUTION_DURATION);
                    }
                }
                Err(err) => {
                    if let Err(abort_err) = writer.abort() {
                        warn!(error = %abort_err, "error removing catchpoint data file");
                    }
                    return Err(err.context(format!(
                        "unable to create catchpoint data file for round {}",
                        accounts_round
                    )));
                }
            }
        }

        metrics::CATCHPOINT_DATA_FILES_WRITTEN.inc();
        Ok(writer.stats())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_first_stage_info(
        &self,
        tx: &mut dyn TransactionScope,
        accounts_round: Round,
        file_stats: &FileWriterStats,
        total_online_accounts: u64,
        total_online_round_params: u64,
        state_proof_verification_hash: Digest,
        online_accounts_hash: Digest,
        online_round_params_hash: Digest,
        updating_balances_duration: Duration,
    ) -> Result<()> {
        let totals = tx.accounts_totals()?;

        // The trie is borrowed out of the shared state for the root-hash
        // read and restored regardless of the outcome.
        let mut trie = self
            .shared
            .write()
            .balances_trie
            .take()
            .unwrap_or_else(|| (self.trie_factory)());
        let root_result = trie.root_hash(tx.merkle_committer());
        self.shared.write().balances_trie = Some(trie);
        let trie_balances_hash = root_result?;

        let info = CatchpointFirstStageInfo {
            totals,
            total_accounts: file_stats.total_accounts,
            total_kvs: file_stats.total_kvs,
            total_online_accounts,
            total_online_round_params,
            total_chunks: file_stats.total_chunks,
            biggest_chunk_len: file_stats.biggest_chunk_len,
            trie_balances_hash,
            state_proof_verification_hash,
            online_accounts_hash,
            online_round_params_hash,
        };
        tx.insert_first_stage_info(accounts_round, &info)?;

        metrics::CATCHPOINT_LAST_FIRST_STAGE_ROUND.set(accounts_round as i64);
        info!(
            accounts_round,
            accounts_count = file_stats.total_accounts,
            kvs_count = file_stats.total_kvs,
            file_size = file_stats.written_bytes,
            balances_write_time = ?updating_balances_duration,
            merkle_trie_root = %trie_balances_hash,
            "catchpoint data file was generated"
        );
        Ok(())
    }

    /// Concludes the catchpoint for a block round, or discards the marker
    /// if the matching first-stage info is gone.
    fn finish_catchpoint(
        &self,
        round: Round,
        block_hash: Digest,
        block_proto: &ConsensusVersion,
        catchpoint_lookback: u64,
    ) -> Result<()> {
        let accounts_round = round - catchpoint_lookback;

        info!(round, accounts_round, "finishing catchpoint");

        let data_info = with_snapshot(&*self.store, |snapshot| {
            snapshot.select_first_stage_info(accounts_round)
        })?;

        match data_info {
            None => with_transaction(&*self.store, |tx| tx.delete_unfinished_catchpoint(round)),
            Some(data_info) => {
                self.create_catchpoint(accounts_round, round, &data_info, block_hash, block_proto)
            }
        }
    }

    /// Creates the catchpoint: derives and persists the label, and (when
    /// file generation is on and the data file still exists) repacks the
    /// final archive and registers it.
    fn create_catchpoint(
        &self,
        accounts_round: Round,
        round: Round,
        data_info: &CatchpointFirstStageInfo,
        block_hash: Digest,
        block_proto: &ConsensusVersion,
    ) -> Result<()> {
        let start_time = Instant::now();
        let params = self.consensus.params(block_proto);

        let (label, version) = if params.enable_catchpoints_with_online_accounts {
            if !params.enable_catchpoints_with_sp_contexts {
                return Err(CatchpointError::VersionMisconfiguration.into());
            }
            (
                make_label(&CatchpointLabelMaker::V8 {
                    round,
                    block_hash: &block_hash,
                    balances_root: &data_info.trie_balances_hash,
                    totals: &data_info.totals,
                    sp_verification_hash: &data_info.state_proof_verification_hash,
                    online_accounts_hash: &data_info.online_accounts_hash,
                    online_round_params_hash: &data_info.online_round_params_hash,
                }),
                CATCHPOINT_FILE_VERSION_V8,
            )
        } else if params.enable_catchpoints_with_sp_contexts {
            (
                make_label(&CatchpointLabelMaker::V7 {
                    round,
                    block_hash: &block_hash,
                    balances_root: &data_info.trie_balances_hash,
                    totals: &data_info.totals,
                    sp_verification_hash: &data_info.state_proof_verification_hash,
                }),
                CATCHPOINT_FILE_VERSION_V7,
            )
        } else {
            (
                make_label(&CatchpointLabelMaker::V6 {
                    round,
                    block_hash: &block_hash,
                    balances_root: &data_info.trie_balances_hash,
                    totals: &data_info.totals,
                }),
                CATCHPOINT_FILE_VERSION_V6,
            )
        };

        info!(round, accounts_round, label = %label, "creating catchpoint");

        with_transaction(&*self.store, |tx| {
            tx.write_state_string(CatchpointStateKey::LastCatchpoint, &label)
        })?;
        self.shared.write().last_catchpoint_label = label.clone();

        if !self.enable_generating_catchpoint_files {
            return Ok(());
        }

        let data_file_path = self
            .tmp_dir
            .join(CATCHPOINT_DIR_NAME)
            .join(make_catchpoint_data_file_path(accounts_round));
        match fs::metadata(&data_file_path) {
            Ok(_) => {}
            // Without the data file there is nothing to repack; the label
            // alone stands.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("checking data file {:?}", data_file_path))
            }
        }

        let header = CatchpointFileHeader {
            version,
            balances_round: accounts_round,
            blocks_round: round,
            totals: data_info.totals,
            total_accounts: data_info.total_accounts,
            total_kvs: data_info.total_kvs,
            total_online_accounts: data_info.total_online_accounts,
            total_online_round_params: data_info.total_online_round_params,
            total_chunks: data_info.total_chunks,
            catchpoint: label.clone(),
            block_header_digest: block_hash,
        };

        let rel_catchpoint_file_path = format!(
            "{}/{}",
            CATCHPOINT_DIR_NAME,
            make_catchpoint_file_path(round)
        );
        let abs_catchpoint_file_path = self.db_directory.join(&rel_catchpoint_file_path);

        repack::repack_catchpoint(
            &self.cancel,
            &header,
            data_info.biggest_chunk_len,
            &data_file_path,
            &abs_catchpoint_file_path,
        )?;

        let file_size = fs::metadata(&abs_catchpoint_file_path)
            .with_context(|| format!("reading back {:?}", abs_catchpoint_file_path))?
            .len();

        with_transaction(&*self.store, |tx| {
            self.record_catchpoint_file(tx, round, &rel_catchpoint_file_path, file_size)?;
            tx.delete_unfinished_catchpoint(round)
        })?;

        metrics::CATCHPOINT_FILES_CREATED.inc();
        metrics::CATCHPOINT_LAST_CATCHPOINT_ROUND.set(round as i64);
        info!(
            round,
            accounts_round,
            label = %label,
            file_size,
            filepath = %rel_catchpoint_file_path,
            accounts_count = data_info.total_accounts,
            kvs_count = data_info.total_kvs,
            writing_duration = ?start_time.elapsed(),
            "catchpoint file was created"
        );
        Ok(())
    }

    /// Registers a finished archive, then realigns the registry and the
    /// disk with the configured history length by deleting up to two of
    /// the oldest entries beyond it.
    fn record_catchpoint_file(
        &self,
        tx: &mut dyn TransactionScope,
        round: Round,
        rel_catchpoint_file_path: &str,
        file_size: u64,
    ) -> Result<()> {
        if self.catchpoint_file_history_length != 0 {
            tx.store_catchpoint_file(round, rel_catchpoint_file_path, file_size)
                .context("unable to save catchpoint")?;
        } else {
            remove_single_catchpoint_file_from_disk(&self.db_directory, rel_catchpoint_file_path)
                .with_context(|| {
                    format!("unable to remove file ({})", rel_catchpoint_file_path)
                })?;
        }
        if self.catchpoint_file_history_length == -1 {
            return Ok(());
        }
        let files_to_delete =
            tx.oldest_catchpoint_files(2, self.catchpoint_file_history_length as usize)?;
        for record in files_to_delete {
            remove_single_catchpoint_file_from_disk(&self.db_directory, &record.rel_path)?;
            tx.store_catchpoint_file(record.round, "", 0)
                .with_context(|| {
                    format!("unable to delete old catchpoint entry '{}'", record.rel_path)
                })?;
        }
        Ok(())
    }

    /// Opens the archive registered for `round`. A registry row whose file
    /// is missing is cleaned up and reported as [`CatchpointError::NoEntry`];
    /// an unregistered file found on disk is re-registered and served.
    pub fn get_catchpoint_stream(&self, round: Round) -> Result<CatchpointStream> {
        metrics::CATCHPOINT_STREAM_REQUESTS.inc();

        let record = with_snapshot(&*self.store, |snapshot| {
            snapshot.get_catchpoint_file(round)
        })
        .with_context(|| format!("unable to lookup catchpoint {}", round))?;

        if let Some(record) = record {
            let catchpoint_path = self.db_directory.join(&record.rel_path);
            match File::open(&catchpoint_path) {
                Ok(file) => return Ok(CatchpointStream::new(file, record.size as i64)),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    // The registry told us we have this file, but it is
                    // gone; delete the row.
                    with_transaction(&*self.store, |tx| {
                        self.record_catchpoint_file(tx, round, "", 0)
                    })
                    .context("unable to delete missing catchpoint entry")?;
                    return Err(CatchpointError::NoEntry(round).into());
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("unable to open catchpoint file {:?}", catchpoint_path)
                    })
                }
            }
        }

        // The registry does not know about the round; serve (and
        // re-register) the file if it happens to exist anyway.
        let rel_catchpoint_file_path = format!(
            "{}/{}",
            CATCHPOINT_DIR_NAME,
            make_catchpoint_file_path(round)
        );
        let abs_catchpoint_file_path = self.db_directory.join(&rel_catchpoint_file_path);
        match File::open(&abs_catchpoint_file_path) {
            Ok(file) => {
                let size = match file.metadata() {
                    Ok(metadata) => metadata.len() as i64,
                    Err(_) => -1,
                };
                if size >= 0 {
                    if let Err(err) = with_transaction(&*self.store, |tx| {
                        self.record_catchpoint_file(
                            tx,
                            round,
                            &rel_catchpoint_file_path,
                            size as u64,
                        )
                    }) {
                        warn!(round, error = %err, "unable to save missing catchpoint entry");
                    }
                }
                Ok(CatchpointStream::new(file, size))
            }
            Err(_) => Err(CatchpointError::NoEntry(round).into()),
        }
    }

    /// Deletes first-stage records and data files for rounds at or below
    /// `max_round_to_delete`. Only called with bounds that keep every
    /// record a pending second stage still needs.
    fn prune_first_stage_records(&self, max_round_to_delete: Round) -> Result<()> {
        let rounds = with_snapshot(&*self.store, |snapshot| {
            snapshot.select_old_first_stage_rounds(max_round_to_delete)
        })?;
        for round in rounds {
            let rel_data_file_path = format!(
                "{}/{}",
                CATCHPOINT_DIR_NAME,
                make_catchpoint_data_file_path(round)
            );
            remove_single_catchpoint_file_from_disk(&self.tmp_dir, &rel_data_file_path)?;
        }
        with_transaction(&*self.store, |tx| {
            tx.delete_old_first_stage_info(max_round_to_delete)
        })
    }

    /// Brings the persisted account hashes in line with the committed base
    /// round, rebuilding the trie from scratch when they diverge (or were
    /// never built).
    fn initialize_hashes(&self, tx: &mut dyn TransactionScope, rnd: Round) -> Result<()> {
        let hash_round = tx.accounts_hash_round()?;

        if hash_round != rnd {
            // The hashes are not in sync with the account base; reset and
            // rebuild below.
            tx.reset_account_hashes()?;
            if !self.catchpoint_enabled() {
                return Ok(());
            }
        }

        let mut trie = (self.trie_factory)();
        let root_hash = trie
            .root_hash(tx.merkle_committer())
            .context("initialize_hashes was unable to retrieve trie root hash")?;

        if root_hash.is_zero() {
            info!(round = rnd, "rebuilding merkle trie");
            let start_time = Instant::now();
            let mut last_progress_log = Instant::now();
            let mut trie_hash_count = 0usize;
            let mut pending_trie_hashes = 0usize;

            let mut cursor = 0usize;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(CatchpointError::Cancelled.into());
                }
                let entries =
                    tx.ordered_account_hashes(cursor, TRIE_REBUILD_ACCOUNT_CHUNK_SIZE)?;
                if entries.is_empty() {
                    break;
                }
                cursor += entries.len();
                for entry in &entries {
                    let added = trie
                        .add(tx.merkle_committer(), &entry.digest)
                        .context("initialize_hashes was unable to add account to trie")?;
                    if !added {
                        // Stale state leaked into the hash table; not fatal
                        // for a rebuild.
                        warn!(
                            hash = %entry.digest,
                            address = %hex_prefix(&entry.address),
                            "attempted to add duplicate hash to merkle trie"
                        );
                    }
                    trie_hash_count += 1;
                    pending_trie_hashes += 1;
                    if pending_trie_hashes >= TRIE_REBUILD_COMMIT_FREQUENCY {
                        trie.evict(Some(tx.merkle_committer()))
                            .context("initialize_hashes was unable to commit changes to trie")?;
                        pending_trie_hashes = 0;
                    }
                }
                if last_progress_log.elapsed() > REBUILD_PROGRESS_INTERVAL {
                    info!(processed = trie_hash_count, "still building the merkle trie");
                    last_progress_log = Instant::now();
                }
            }
            trie.evict(Some(tx.merkle_committer()))
                .context("initialize_hashes was unable to commit changes to trie")?;

            // Now the key-value entries.
            let mut cursor = 0usize;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(CatchpointError::Cancelled.into());
                }
                let entries = tx.kv_entries(cursor, TRIE_REBUILD_ACCOUNT_CHUNK_SIZE)?;
                if entries.is_empty() {
                    break;
                }
                cursor += entries.len();
                for (key, value) in &entries {
                    let hash = kv_hash_builder_v6(key, value);
                    let added = trie
                        .add(tx.merkle_committer(), &hash)
                        .context("initialize_hashes was unable to add kv to trie")?;
                    if !added {
                        warn!(hash = %hash, "attempted to add duplicate kv hash to merkle trie");
                    }
                    trie_hash_count += 1;
                    pending_trie_hashes += 1;
                    if pending_trie_hashes >= TRIE_REBUILD_COMMIT_FREQUENCY {
                        trie.evict(Some(tx.merkle_committer()))
                            .context("initialize_hashes was unable to commit changes to trie")?;
                        pending_trie_hashes = 0;
                    }
                }
            }
            trie.evict(Some(tx.merkle_committer()))
                .context("initialize_hashes was unable to commit changes to trie")?;

            tx.update_accounts_hash_round(rnd).with_context(|| {
                format!("initialize_hashes was unable to update the hash round to {}", rnd)
            })?;

            info!(
                entries = trie_hash_count,
                elapsed = ?start_time.elapsed(),
                "rebuilt the merkle trie"
            );
        }

        self.shared.write().balances_trie = Some(trie);
        Ok(())
    }

    fn recover_from_crash(&self, db_round: Round, block_proto: &ConsensusVersion) -> Result<()> {
        self.finish_first_stage_after_crash(db_round, block_proto)?;

        let catchpoint_lookback = with_snapshot(&*self.store, |snapshot| {
            snapshot.read_state_u64(CatchpointStateKey::CatchpointLookback)
        })?;

        if catchpoint_lookback != 0 {
            self.finish_catchpoints_after_crash(block_proto, catchpoint_lookback)?;

            if db_round >= catchpoint_lookback {
                self.prune_first_stage_records(db_round - catchpoint_lookback)?;
            }
        }
        Ok(())
    }

    /// Possibly finish generating the first-stage record and data file
    /// after a crash: the persistent flag says whether one was interrupted.
    fn finish_first_stage_after_crash(
        &self,
        db_round: Round,
        block_proto: &ConsensusVersion,
    ) -> Result<()> {
        let writing = with_snapshot(&*self.store, |snapshot| {
            snapshot.read_state_u64(CatchpointStateKey::WritingFirstStageInfo)
        })?;
        if writing == 0 {
            return Ok(());
        }

        // First, delete the unfinished data file.
        let rel_data_file_path = format!(
            "{}/{}",
            CATCHPOINT_DIR_NAME,
            make_catchpoint_data_file_path(db_round)
        );
        remove_single_catchpoint_file_from_disk(&self.tmp_dir, &rel_data_file_path)?;

        // The hashes are recomputed from the restored state, so re-running
        // the stage is idempotent.
        self.finish_first_stage(db_round, block_proto, Duration::ZERO)
    }

    fn finish_catchpoints_after_crash(
        &self,
        block_proto: &ConsensusVersion,
        catchpoint_lookback: u64,
    ) -> Result<()> {
        let records = with_snapshot(&*self.store, |snapshot| {
            snapshot.select_unfinished_catchpoints()
        })?;

        for record in records {
            // First, delete the unfinished catchpoint file.
            let rel_catchpoint_file_path = format!(
                "{}/{}",
                CATCHPOINT_DIR_NAME,
                make_catchpoint_file_path(record.round)
            );
            remove_single_catchpoint_file_from_disk(&self.db_directory, &rel_catchpoint_file_path)?;

            self.finish_catchpoint(
                record.round,
                record.block_hash,
                block_proto,
                catchpoint_lookback,
            )?;
        }
        Ok(())
    }
}

fn hex_prefix(address: &[u8; 32]) -> String {
    address[..4].iter().map(|b| format!("{:02x}", b)).collect()
}
