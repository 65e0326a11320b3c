// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core value types shared by the tracker, the store contract and the
//! on-disk formats. Everything that ends up inside an archive or a label is
//! encoded with the canonical msgpack codec ([`encode_msgpack`]) so that
//! equal values always produce byte-equal encodings.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::HashMap, fmt};

/// A ledger state version. Monotonically increasing, starting at 0.
pub type Round = u64;

/// An account address.
pub type Address = [u8; 32];

/// Size of a [`Digest`] in bytes.
pub const DIGEST_SIZE: usize = 32;

/// A fixed-width 256-bit digest, used both as a trie key and as a file /
/// label integrity hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    /// The all-zero digest. An empty trie reports this as its root.
    pub const ZERO: Digest = Digest([0u8; DIGEST_SIZE]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

// Digests are serialized as raw bytes (msgpack `bin`), not as an integer
// sequence, to keep the on-disk encodings compact and canonical.
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DigestVisitor;

        impl<'de> de::Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "{} bytes", DIGEST_SIZE)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Digest, E> {
                if v.len() != DIGEST_SIZE {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; DIGEST_SIZE];
                out.copy_from_slice(v);
                Ok(Digest(out))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Digest, A::Error> {
                let mut out = [0u8; DIGEST_SIZE];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Digest(out))
            }
        }

        deserializer.deserialize_bytes(DigestVisitor)
    }
}

/// Encodes a value with the canonical msgpack codec (structs as arrays,
/// deterministic field order). Encoding plain data types cannot fail.
pub fn encode_msgpack<T: Serialize>(value: &T) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("msgpack encoding of a plain value")
}

/// Decodes a value previously produced by [`encode_msgpack`].
pub fn decode_msgpack<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// An opaque consensus version identifier, as carried in block headers.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ConsensusVersion(pub String);

impl ConsensusVersion {
    pub fn new(v: impl Into<String>) -> Self {
        ConsensusVersion(v.into())
    }
}

impl fmt::Display for ConsensusVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The consensus parameters the tracker cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusParams {
    /// Catchpoint labels (and files) carry a state proof verification
    /// context hash; files are written in the V7 format or newer.
    pub enable_catchpoints_with_sp_contexts: bool,
    /// Catchpoint labels carry online-accounts and online-round-params
    /// hashes; files are written in the V8 format.
    pub enable_catchpoints_with_online_accounts: bool,
    /// Rounds between a catchpoint's accounts round and its block round.
    pub catchpoint_lookback: u64,
    /// Fallback for `catchpoint_lookback` when it is zero.
    pub max_bal_lookback: u64,
}

/// Resolves consensus versions to parameters. An explicit record passed at
/// construction; unknown versions resolve to the all-disabled default.
#[derive(Clone, Debug, Default)]
pub struct ConsensusRegistry {
    params: HashMap<ConsensusVersion, ConsensusParams>,
}

impl ConsensusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, version: ConsensusVersion, params: ConsensusParams) {
        self.params.insert(version, params);
    }

    pub fn with(mut self, version: ConsensusVersion, params: ConsensusParams) -> Self {
        self.insert(version, params);
        self
    }

    pub fn params(&self, version: &ConsensusVersion) -> ConsensusParams {
        self.params.get(version).cloned().unwrap_or_default()
    }
}

/// A block header, as far as this tracker is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub round: Round,
    pub digest: Digest,
    pub consensus_version: ConsensusVersion,
}

/// A money amount together with its accumulated reward units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCount {
    pub money: u64,
    pub reward_units: u64,
}

/// Totals over all accounts, broken down by participation status. Part of
/// every catchpoint label and file header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTotals {
    pub online: BalanceCount,
    pub offline: BalanceCount,
    pub not_participating: BalanceCount,
    pub rewards_level: u64,
}

/// The account fields the tracker needs for hashing. The full account record
/// is otherwise opaque and travels as its canonical encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    pub status: u8,
    pub micro_balance: u64,
    pub rewards_base: u64,
    pub update_round: Round,
}

impl AccountData {
    pub fn is_empty(&self) -> bool {
        *self == AccountData::default()
    }

    pub fn encoded(&self) -> Vec<u8> {
        encode_msgpack(self)
    }
}

/// The kind of creatable a resource belongs to. Feeds the hash-kind tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    #[default]
    Asset,
    App,
}

/// A resource record (asset holding / app local state) attached to an
/// account. Opaque except for the fields the hash builder consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceData {
    pub kind: ResourceKind,
    pub update_round: Round,
    pub payload: Vec<u8>,
}

impl ResourceData {
    pub fn is_empty(&self) -> bool {
        *self == ResourceData::default()
    }

    pub fn encoded(&self) -> Vec<u8> {
        encode_msgpack(self)
    }
}

/// A compacted per-range account delta: the state before the range and the
/// state after it, with intermediate versions squashed away.
#[derive(Clone, Debug, Default)]
pub struct CompactAccountDelta {
    pub address: Address,
    pub old: AccountData,
    pub new: AccountData,
}

/// A compacted per-range resource delta.
#[derive(Clone, Debug, Default)]
pub struct CompactResourceDelta {
    pub address: Address,
    pub asset_index: u64,
    pub old: ResourceData,
    pub new: ResourceData,
}

/// A compacted key-value delta. `None` means absent on that side.
#[derive(Clone, Debug, Default)]
pub struct ModifiedKvValue {
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// One state proof verification context, opaque to the tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpVerificationContext {
    pub data: Vec<u8>,
}

/// The first chunk of every catchpoint archive (`content.msgpack`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchpointFileHeader {
    pub version: u64,
    pub balances_round: Round,
    pub blocks_round: Round,
    pub totals: AccountTotals,
    pub total_accounts: u64,
    pub total_kvs: u64,
    pub total_online_accounts: u64,
    pub total_online_round_params: u64,
    pub total_chunks: u64,
    pub catchpoint: String,
    pub block_header_digest: Digest,
}

/// The record persisted for every completed first stage, keyed by the
/// accounts round. Consumed by the second stage when the block round
/// arrives, possibly after a restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchpointFirstStageInfo {
    pub totals: AccountTotals,
    pub total_accounts: u64,
    pub total_kvs: u64,
    pub total_online_accounts: u64,
    pub total_online_round_params: u64,
    pub total_chunks: u64,
    /// Length of the longest chunk entry, so the repacker can size its copy
    /// buffer up front.
    pub biggest_chunk_len: u64,
    pub trie_balances_hash: Digest,
    pub state_proof_verification_hash: Digest,
    pub online_accounts_hash: Digest,
    pub online_round_params_hash: Digest,
}

/// Marker for a catchpoint whose second stage has not concluded yet.
/// Written at stage-1 commit, deleted after stage-2 success; drives
/// recovery after a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnfinishedCatchpoint {
    pub round: Round,
    pub block_hash: Digest,
}

/// A registered, fully repacked catchpoint file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchpointFileRecord {
    pub round: Round,
    pub rel_path: String,
    pub size: u64,
}

/// One account row as it appears inside a balances chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBalanceRecord {
    pub address: Address,
    pub account_data: Vec<u8>,
}

/// One key-value row as it appears inside a balances chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedKvRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A `balances.<n>.msgpack` archive entry: up to a bounded number of
/// account rows followed by key-value rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancesChunk {
    pub balances: Vec<EncodedBalanceRecord>,
    pub kvs: Vec<EncodedKvRecord>,
}

impl BalancesChunk {
    pub fn len(&self) -> usize {
        self.balances.len() + self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty() && self.kvs.is_empty()
    }
}

/// A precomputed trie digest for one account or resource, yielded by the
/// store's ordered iteration during a trie rebuild. The address is carried
/// for diagnostics only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountHashEntry {
    pub digest: Digest,
    pub address: Address,
}
