// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    file_writer::CATCHPOINT_SP_VERIFICATION_FILE_NAME,
    repack::read_catchpoint_file,
    store::memory::MemoryStore,
    trie::{memory_trie_factory, MemoryTrie},
    types::{
        decode_msgpack, AccountData, AccountTotals, Address, BalanceCount, ConsensusParams,
        SpVerificationContext,
    },
};
use std::collections::BTreeMap;
use tempfile::TempDir;

const INTERVAL: u64 = 100;
const LOOKBACK: u64 = 320;
const PROTO: &str = "proto-test";

fn block_digest(round: Round) -> Digest {
    let mut digest = [0xb5u8; 32];
    digest[..8].copy_from_slice(&round.to_le_bytes());
    Digest(digest)
}

fn address_for_round(round: Round) -> Address {
    let mut address = [0xa0u8; 32];
    address[..8].copy_from_slice(&round.to_le_bytes());
    address
}

struct MockLedger {
    proto: ConsensusVersion,
}

impl LedgerForTracker for MockLedger {
    fn block_hdr(&self, round: Round) -> Result<BlockHeader> {
        Ok(BlockHeader {
            round,
            digest: block_digest(round),
            consensus_version: self.proto.clone(),
        })
    }
}

fn registry(sp_contexts: bool, online_accounts: bool) -> ConsensusRegistry {
    ConsensusRegistry::new().with(
        ConsensusVersion::new(PROTO),
        ConsensusParams {
            enable_catchpoints_with_sp_contexts: sp_contexts,
            enable_catchpoints_with_online_accounts: online_accounts,
            catchpoint_lookback: LOOKBACK,
            max_bal_lookback: LOOKBACK,
        },
    )
}

fn test_totals() -> AccountTotals {
    AccountTotals {
        online: BalanceCount {
            money: 1_000_000,
            reward_units: 12,
        },
        offline: BalanceCount {
            money: 50_000,
            reward_units: 3,
        },
        not_participating: BalanceCount::default(),
        rewards_level: 4,
    }
}

struct PendingDelta {
    round: Round,
    account: CompactAccountDelta,
    kv: Option<(Vec<u8>, ModifiedKvValue)>,
}

/// Drives the tracker the way the surrounding ledger would: blocks are fed
/// one at a time, commits flush all pending rounds (or as many as the
/// tracker narrows the window to).
struct Harness {
    tracker: CatchpointTracker,
    store: MemoryStore,
    ledger: MockLedger,
    tmp_dir: TempDir,
    cold_dir: TempDir,
    next_round: Round,
    old_base: Round,
    pending: Vec<PendingDelta>,
    account_mirror: BTreeMap<Address, AccountData>,
    kv_mirror: BTreeMap<Vec<u8>, Vec<u8>>,
}

fn build_tracker(
    store: &MemoryStore,
    tmp_dir: &TempDir,
    cold_dir: &TempDir,
    consensus: ConsensusRegistry,
    history_length: i64,
    enable_files: bool,
    force_writing: bool,
) -> CatchpointTracker {
    CatchpointTracker::new(
        CatchpointTrackerConfig {
            tmp_dir: tmp_dir.path().to_path_buf(),
            db_directory: cold_dir.path().to_path_buf(),
            catchpoint_interval: INTERVAL,
            catchpoint_file_history_length: history_length,
            enable_generating_catchpoint_files: enable_files,
            force_catchpoint_file_writing: force_writing,
        },
        Arc::new(store.clone()),
        consensus,
        memory_trie_factory(),
    )
}

impl Harness {
    fn new(consensus: ConsensusRegistry, enable_files: bool, force_writing: bool) -> Self {
        let store = MemoryStore::new();
        store.set_totals(test_totals());
        store.set_sp_contexts(vec![SpVerificationContext {
            data: b"sp-context-payload".to_vec(),
        }]);
        store.set_online_rows(
            vec![b"online-account-row".to_vec()],
            vec![b"online-round-params-row".to_vec()],
        );

        let tmp_dir = TempDir::new().unwrap();
        let cold_dir = TempDir::new().unwrap();
        let tracker = build_tracker(
            &store,
            &tmp_dir,
            &cold_dir,
            consensus,
            -1,
            enable_files,
            force_writing,
        );
        let ledger = MockLedger {
            proto: ConsensusVersion::new(PROTO),
        };
        tracker.load_from_disk(&ledger, 0).unwrap();

        Harness {
            tracker,
            store,
            ledger,
            tmp_dir,
            cold_dir,
            next_round: 1,
            old_base: 0,
            pending: Vec::new(),
            account_mirror: BTreeMap::new(),
            kv_mirror: BTreeMap::new(),
        }
    }

    /// Feeds blocks (and per-round deltas) up to and including `round`.
    fn feed_blocks_to(&mut self, round: Round) {
        while self.next_round <= round {
            let r = self.next_round;
            let hdr = self.ledger.block_hdr(r).unwrap();
            self.tracker.new_block(&hdr);

            let address = address_for_round(r);
            let old = self.account_mirror.get(&address).cloned().unwrap_or_default();
            let new = AccountData {
                status: 1,
                micro_balance: 1_000 + r,
                rewards_base: 1,
                update_round: r,
            };
            self.account_mirror.insert(address, new.clone());
            let account = CompactAccountDelta { address, old, new };

            let kv = if r % 5 == 0 {
                let key = format!("box-{}", r % 20).into_bytes();
                let old_value = self.kv_mirror.get(&key).cloned();
                let new_value = format!("value-{}", r).into_bytes();
                self.kv_mirror.insert(key.clone(), new_value.clone());
                Some((
                    key,
                    ModifiedKvValue {
                        old: old_value,
                        new: Some(new_value),
                    },
                ))
            } else {
                None
            };

            self.pending.push(PendingDelta {
                round: r,
                account,
                kv,
            });
            self.next_round += 1;
        }
    }

    /// One commit: lets the tracker inspect (and possibly narrow) the
    /// window, then runs the full commit phase sequence for it.
    fn commit_window(&mut self) {
        assert!(!self.pending.is_empty());
        let offset = self.pending.len() as u64;
        let dcr = DeferredCommitRange {
            old_base: self.old_base,
            offset,
            catchpoint_lookback: LOOKBACK,
            ..Default::default()
        };
        let dcr = self
            .tracker
            .produce_committing_task(self.next_round - 1, self.old_base, dcr)
            .expect("no concurrent writer in tests");

        let committed: Vec<PendingDelta> = self
            .pending
            .drain(..dcr.offset as usize)
            .collect();

        let mut dcc = DeferredCommitContext::new(dcr);
        dcc.flush_time = Some(Instant::now());
        for delta in &committed {
            dcc.compact_account_deltas.push(delta.account.clone());
            if let Some((key, modified)) = &delta.kv {
                let entry = dcc
                    .compact_kv_deltas
                    .entry(key.clone())
                    .or_insert_with(|| ModifiedKvValue {
                        old: modified.old.clone(),
                        new: None,
                    });
                entry.new = modified.new.clone();
            }
            assert!(delta.round <= dcc.new_base());
        }

        self.tracker.prepare_commit(&mut dcc).unwrap();
        // The accounts writer persists the rows in the same transaction
        // window; the in-memory store applies them up front.
        self.store.apply_deltas(
            &dcc.compact_account_deltas,
            &dcc.compact_resources_deltas,
            &dcc.compact_kv_deltas,
        );
        let mut tx = self.store.begin_transaction().unwrap();
        self.tracker.commit_round(tx.as_mut(), &dcc).unwrap();
        tx.commit().unwrap();
        self.tracker.post_commit(&mut dcc);
        self.tracker.post_commit_unlocked(&dcc);

        self.old_base = dcc.new_base();
    }

    /// Commits everything pending, window by window.
    fn flush_all(&mut self) {
        while !self.pending.is_empty() {
            self.commit_window();
        }
    }

    /// Feeds and commits through `round` in windows of `window` blocks.
    fn commit_through(&mut self, round: Round, window: u64) {
        while self.next_round <= round {
            let target = (self.next_round + window - 1).min(round);
            self.feed_blocks_to(target);
            self.flush_all();
        }
    }

    fn data_file_path(&self, accounts_round: Round) -> PathBuf {
        self.tmp_dir
            .path()
            .join(CATCHPOINT_DIR_NAME)
            .join(make_catchpoint_data_file_path(accounts_round))
    }

    fn archive_path(&self, round: Round) -> PathBuf {
        self.cold_dir
            .path()
            .join(CATCHPOINT_DIR_NAME)
            .join(make_catchpoint_file_path(round))
    }

    fn data_files_on_disk(&self) -> Vec<String> {
        let dir = self.tmp_dir.path().join(CATCHPOINT_DIR_NAME);
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
    }

    fn first_stage_info(&self, round: Round) -> Option<CatchpointFirstStageInfo> {
        with_snapshot(&self.store, |snapshot| {
            snapshot.select_first_stage_info(round)
        })
        .unwrap()
    }

    fn writing_flag(&self) -> u64 {
        with_snapshot(&self.store, |snapshot| {
            snapshot.read_state_u64(CatchpointStateKey::WritingFirstStageInfo)
        })
        .unwrap()
    }

    fn unfinished_rounds(&self) -> Vec<Round> {
        with_snapshot(&self.store, |snapshot| {
            Ok(snapshot
                .select_unfinished_catchpoints()?
                .into_iter()
                .map(|record| record.round)
                .collect())
        })
        .unwrap()
    }
}

#[test]
fn two_stage_pipeline_end_to_end() {
    let mut harness = Harness::new(registry(true, true), true, false);

    harness.commit_through(100, 20);

    // Stage 1 ran at the accounts round 80.
    assert!(harness.data_file_path(80).exists());
    assert_eq!(harness.writing_flag(), 0);
    let info_80 = harness.first_stage_info(80).expect("first stage info for 80");
    assert_eq!(info_80.total_accounts, 80);
    assert!(info_80.total_chunks >= 1);
    assert!(!info_80.trie_balances_hash.is_zero());
    assert!(!info_80.state_proof_verification_hash.is_zero());
    assert_eq!(info_80.total_online_accounts, 1);
    assert_eq!(info_80.total_online_round_params, 1);

    harness.commit_through(400, 20);

    // Block 400 arrived: its archive exists, is labelled deterministically
    // from the stage-1 data of round 80, and the marker is gone.
    let expected_label = make_label(&CatchpointLabelMaker::V8 {
        round: 400,
        block_hash: &block_digest(400),
        balances_root: &info_80.trie_balances_hash,
        totals: &info_80.totals,
        sp_verification_hash: &info_80.state_proof_verification_hash,
        online_accounts_hash: &info_80.online_accounts_hash,
        online_round_params_hash: &info_80.online_round_params_hash,
    });
    assert_eq!(harness.tracker.last_catchpoint_label(), expected_label);
    assert!(!harness.unfinished_rounds().contains(&400));

    let archive = harness.archive_path(400);
    assert!(archive.exists());
    let entries = read_catchpoint_file(&archive).unwrap();
    assert_eq!(entries[0].0, "content.msgpack");
    let header: CatchpointFileHeader = decode_msgpack(&entries[0].1).unwrap();
    assert_eq!(header.version, CATCHPOINT_FILE_VERSION_V8);
    assert_eq!(header.balances_round, 80);
    assert_eq!(header.blocks_round, 400);
    assert_eq!(header.catchpoint, expected_label);
    assert_eq!(header.block_header_digest, block_digest(400));
    assert_eq!(header.total_chunks, info_80.total_chunks);
    assert_eq!(entries[1].0, CATCHPOINT_SP_VERIFICATION_FILE_NAME);
    assert_eq!(entries.len() as u64, 2 + header.total_chunks);

    // The registered stream serves the archive back.
    let mut stream = harness.tracker.get_catchpoint_stream(400).unwrap();
    let mut served = Vec::new();
    stream.read_to_end(&mut served).unwrap();
    assert_eq!(served.len() as i64, stream.size());
    assert_eq!(served, fs::read(&archive).unwrap());

    harness.commit_through(500, 20);

    // All five anchors produced data files; pruning keeps only the ones a
    // future second stage may still need (rounds above 500 - 320 = 180).
    assert!(harness.archive_path(500).exists());
    assert_eq!(
        harness.data_files_on_disk(),
        vec!["280.data", "380.data", "480.data"]
    );
    assert!(harness.first_stage_info(80).is_none());
    assert!(harness.first_stage_info(180).is_none());
    assert!(harness.first_stage_info(280).is_some());
}

#[test]
fn incremental_trie_matches_rebuild() {
    let mut harness = Harness::new(registry(true, true), true, false);
    harness.commit_through(130, 10);

    // The persisted hash round tracks the committed base.
    let hash_round = with_snapshot(&harness.store, |snapshot| snapshot.accounts_hash_round())
        .unwrap();
    assert_eq!(hash_round, harness.old_base);

    // Root as maintained incrementally, read through a fresh attach.
    let incremental_root = {
        let mut tx = harness.store.begin_transaction().unwrap();
        let mut trie = MemoryTrie::new();
        trie.root_hash(tx.merkle_committer()).unwrap()
    };
    assert!(!incremental_root.is_zero());

    // Rebuilding from the rows yields the identical root.
    let mut tx = harness.store.begin_transaction().unwrap();
    tx.reset_account_hashes().unwrap();
    harness
        .tracker
        .initialize_hashes(tx.as_mut(), harness.old_base)
        .unwrap();
    let mut rebuilt = MemoryTrie::new();
    let rebuilt_root = rebuilt.root_hash(tx.merkle_committer()).unwrap();
    assert_eq!(rebuilt_root, incremental_root);
}

#[test]
fn first_stage_crash_replay_is_idempotent() {
    let mut harness = Harness::new(registry(true, true), true, false);
    harness.commit_through(80, 20);
    assert_eq!(harness.old_base, 80);
    let info_before = harness.first_stage_info(80).expect("info for 80");
    assert_eq!(harness.writing_flag(), 0);

    // Crash window: the info row landed but the flag survived.
    with_transaction(&harness.store, |tx| {
        tx.write_state_u64(CatchpointStateKey::WritingFirstStageInfo, 1)
    })
    .unwrap();

    // Restart: a new tracker on the same store and directories.
    let tracker = build_tracker(
        &harness.store,
        &harness.tmp_dir,
        &harness.cold_dir,
        registry(true, true),
        -1,
        true,
        false,
    );
    tracker.load_from_disk(&harness.ledger, 80).unwrap();

    assert_eq!(harness.writing_flag(), 0);
    // Exactly one data file for the base round, no duplicates.
    assert_eq!(harness.data_files_on_disk(), vec!["80.data"]);
    let info_after = harness.first_stage_info(80).expect("info re-recorded");
    assert_eq!(info_after, info_before);
}

#[test]
fn skipped_intermediate_first_stage_rounds() {
    let mut harness = Harness::new(registry(true, true), true, false);

    // Two stage-1 anchors (80 and 180) land in a single commit range; the
    // first is skipped and the writer is told to hurry.
    harness.feed_blocks_to(200);
    harness.flush_all();

    assert_eq!(harness.old_base, 200);
    assert_eq!(harness.data_files_on_disk(), vec!["180.data"]);
    assert!(harness.first_stage_info(80).is_none());
    assert!(harness.first_stage_info(180).is_some());
    assert!(harness.tracker.shared.read().slow_writing.is_closed());
}

#[test]
fn legacy_v6_archive_has_no_sp_context_chunk() {
    // SP contexts disabled: only the force mode generates files, and they
    // use the V6 format.
    let mut harness = Harness::new(registry(false, false), true, true);
    harness.commit_through(400, 50);

    let archive = harness.archive_path(400);
    assert!(archive.exists());
    let entries = read_catchpoint_file(&archive).unwrap();
    let header: CatchpointFileHeader = decode_msgpack(&entries[0].1).unwrap();
    assert_eq!(header.version, CATCHPOINT_FILE_VERSION_V6);
    assert!(header.catchpoint.starts_with("400#"));
    assert!(entries
        .iter()
        .all(|(name, _)| name != CATCHPOINT_SP_VERIFICATION_FILE_NAME));
    assert_eq!(entries[1].0, "balances.0.msgpack");

    let info = harness.first_stage_info(80);
    // Pruned by now (base 400 - lookback 320 = 80), or still holding a
    // zero SP hash if the window boundary kept it.
    if let Some(info) = info {
        assert!(info.state_proof_verification_hash.is_zero());
    }
}

#[test]
fn catchpoint_file_history_is_bounded() {
    let store = MemoryStore::new();
    let tmp_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let tracker = build_tracker(
        &store,
        &tmp_dir,
        &cold_dir,
        registry(true, true),
        2,
        true,
        false,
    );

    let rounds: Vec<Round> = (1..=5).map(|i| i * 100).collect();
    for &round in &rounds {
        let rel = format!("{}/{}", CATCHPOINT_DIR_NAME, make_catchpoint_file_path(round));
        let abs = cold_dir.path().join(&rel);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, b"archive").unwrap();
        with_transaction(&store, |tx| {
            tracker.record_catchpoint_file(tx, round, &rel, 7)
        })
        .unwrap();
    }

    // Exactly the two most recent remain, in the registry and on disk.
    for &round in &rounds {
        let registered = with_snapshot(&store, |snapshot| snapshot.get_catchpoint_file(round))
            .unwrap()
            .is_some();
        let on_disk = cold_dir
            .path()
            .join(CATCHPOINT_DIR_NAME)
            .join(make_catchpoint_file_path(round))
            .exists();
        let expected = round >= 400;
        assert_eq!(registered, expected, "registry for round {}", round);
        assert_eq!(on_disk, expected, "disk for round {}", round);
    }
}

#[test]
fn missing_file_cleans_registry_row() {
    let store = MemoryStore::new();
    let tmp_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let tracker = build_tracker(
        &store,
        &tmp_dir,
        &cold_dir,
        registry(true, true),
        -1,
        true,
        false,
    );

    // The registry claims a file that is not on disk.
    with_transaction(&store, |tx| {
        tx.store_catchpoint_file(300, "catchpoints/gone.catchpoint", 42)
    })
    .unwrap();

    let err = tracker.get_catchpoint_stream(300).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CatchpointError>(),
        Some(CatchpointError::NoEntry(300))
    ));
    let record = with_snapshot(&store, |snapshot| snapshot.get_catchpoint_file(300)).unwrap();
    assert!(record.is_none());

    // A round nobody ever produced reports the same sentinel.
    let err = tracker.get_catchpoint_stream(12345).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CatchpointError>(),
        Some(CatchpointError::NoEntry(12345))
    ));
}

#[test]
fn unregistered_file_on_disk_is_recovered() {
    let store = MemoryStore::new();
    let tmp_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let tracker = build_tracker(
        &store,
        &tmp_dir,
        &cold_dir,
        registry(true, true),
        -1,
        true,
        false,
    );

    let rel = format!("{}/{}", CATCHPOINT_DIR_NAME, make_catchpoint_file_path(700));
    let abs = cold_dir.path().join(&rel);
    fs::create_dir_all(abs.parent().unwrap()).unwrap();
    fs::write(&abs, b"found-me").unwrap();

    let mut stream = tracker.get_catchpoint_stream(700).unwrap();
    let mut content = Vec::new();
    stream.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"found-me");
    assert_eq!(stream.size(), 8);

    let record = with_snapshot(&store, |snapshot| snapshot.get_catchpoint_file(700))
        .unwrap()
        .expect("row re-registered");
    assert_eq!(record.rel_path, rel);
}

#[test]
fn label_only_mode_writes_no_files() {
    let mut harness = Harness::new(registry(true, true), false, false);
    harness.commit_through(400, 50);

    let label = harness.tracker.last_catchpoint_label();
    assert!(label.starts_with("400#"));
    assert!(harness.data_files_on_disk().is_empty());
    assert!(!harness.archive_path(400).exists());
    // Without a file there is nothing to conclude stage 2 with; the marker
    // stays until the first-stage info ages out and a later boot drops it.
    assert_eq!(harness.unfinished_rounds(), vec![400]);

    let stored = with_snapshot(&harness.store, |snapshot| {
        snapshot.read_state_string(CatchpointStateKey::LastCatchpoint)
    })
    .unwrap();
    assert_eq!(stored, label);
}

#[test]
fn disabled_interval_schedules_nothing() {
    let store = MemoryStore::new();
    let tmp_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let tracker = CatchpointTracker::new(
        CatchpointTrackerConfig {
            tmp_dir: tmp_dir.path().to_path_buf(),
            db_directory: cold_dir.path().to_path_buf(),
            catchpoint_interval: 0,
            catchpoint_file_history_length: -1,
            enable_generating_catchpoint_files: true,
            force_catchpoint_file_writing: false,
        },
        Arc::new(store.clone()),
        registry(true, true),
        memory_trie_factory(),
    );
    let ledger = MockLedger {
        proto: ConsensusVersion::new(PROTO),
    };
    tracker.load_from_disk(&ledger, 0).unwrap();

    let dcr = DeferredCommitRange {
        old_base: 0,
        offset: 500,
        catchpoint_lookback: LOOKBACK,
        ..Default::default()
    };
    let dcr = tracker.produce_committing_task(500, 0, dcr).unwrap();
    assert!(!dcr.catchpoint_first_stage);
    assert!(!dcr.catchpoint_second_stage);
    assert_eq!(dcr.offset, 500);

    let mut dcc = DeferredCommitContext::new(dcr);
    for round in 1..=500 {
        tracker.new_block(&ledger.block_hdr(round).unwrap());
    }
    tracker.prepare_commit(&mut dcc).unwrap();
    let mut tx = store.begin_transaction().unwrap();
    tracker.commit_round(tx.as_mut(), &dcc).unwrap();
    tx.commit().unwrap();
    tracker.post_commit(&mut dcc);
    tracker.post_commit_unlocked(&dcc);

    assert!(harness_is_empty(&tmp_dir));
    assert_eq!(
        with_snapshot(&store, |s| s.select_unfinished_catchpoints()).unwrap(),
        Vec::new()
    );
}

fn harness_is_empty(tmp_dir: &TempDir) -> bool {
    !tmp_dir.path().join(CATCHPOINT_DIR_NAME).exists()
}

#[test]
fn commit_error_handling_clears_sentinel_and_trie() {
    let mut harness = Harness::new(registry(true, true), true, false);
    harness.feed_blocks_to(80);

    let dcr = DeferredCommitRange {
        old_base: 0,
        offset: 80,
        catchpoint_lookback: LOOKBACK,
        ..Default::default()
    };
    let dcr = harness
        .tracker
        .produce_committing_task(80, 0, dcr)
        .unwrap();
    assert!(dcr.catchpoint_first_stage);

    let mut dcc = DeferredCommitContext::new(dcr);
    harness.tracker.prepare_commit(&mut dcc).unwrap();
    assert!(harness.tracker.is_writing_catchpoint_data_file());

    // The ledger reports a failed commit: the sentinel clears and the trie
    // is dropped for reconstruction.
    harness.tracker.handle_commit_error(&dcc);
    assert!(!harness.tracker.is_writing_catchpoint_data_file());
    assert!(harness.tracker.shared.read().balances_trie.is_none());

    // An out-of-order delivery is rejected at prepare time.
    let bad_range = DeferredCommitRange {
        old_base: 0,
        offset: 10_000,
        catchpoint_lookback: LOOKBACK,
        ..Default::default()
    };
    let mut bad = DeferredCommitContext::new(bad_range);
    let err = harness.tracker.prepare_commit(&mut bad).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CatchpointError>(),
        Some(CatchpointError::UnorderedCommit { .. })
    ));
    harness.tracker.handle_prepare_commit_error(&bad);
    assert!(!harness.tracker.is_writing_catchpoint_data_file());
}

#[test]
fn delta_application_is_invertible() {
    let store = MemoryStore::new();
    let tmp_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let tracker = build_tracker(
        &store,
        &tmp_dir,
        &cold_dir,
        registry(true, true),
        -1,
        true,
        false,
    );

    let forward = {
        let mut dcc = DeferredCommitContext::new(DeferredCommitRange {
            old_base: 0,
            offset: 3,
            catchpoint_lookback: LOOKBACK,
            ..Default::default()
        });
        for round in 1..=3u64 {
            dcc.compact_account_deltas.push(CompactAccountDelta {
                address: address_for_round(round),
                old: AccountData::default(),
                new: AccountData {
                    status: 1,
                    micro_balance: round,
                    rewards_base: 1,
                    update_round: round,
                },
            });
        }
        dcc.compact_kv_deltas.insert(
            b"box".to_vec(),
            ModifiedKvValue {
                old: None,
                new: Some(b"v1".to_vec()),
            },
        );
        dcc
    };

    let mut tx = store.begin_transaction().unwrap();
    let mut trie = MemoryTrie::new();
    let empty_root = trie.root_hash(tx.merkle_committer()).unwrap();

    tracker
        .accounts_update_balances(&mut trie, tx.merkle_committer(), &forward)
        .unwrap();
    let advanced_root = trie.root_hash(tx.merkle_committer()).unwrap();
    assert_ne!(advanced_root, empty_root);

    // Invert every delta: the root returns to its original value.
    let mut inverse = DeferredCommitContext::new(forward.range.clone());
    for delta in forward.compact_account_deltas.iter().rev() {
        inverse.compact_account_deltas.push(CompactAccountDelta {
            address: delta.address,
            old: delta.new.clone(),
            new: delta.old.clone(),
        });
    }
    for (key, modified) in &forward.compact_kv_deltas {
        inverse.compact_kv_deltas.insert(
            key.clone(),
            ModifiedKvValue {
                old: modified.new.clone(),
                new: modified.old.clone(),
            },
        );
    }
    tracker
        .accounts_update_balances(&mut trie, tx.merkle_committer(), &inverse)
        .unwrap();
    assert_eq!(trie.root_hash(tx.merkle_committer()).unwrap(), empty_root);
}
