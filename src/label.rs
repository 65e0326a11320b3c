// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Catchpoint label derivation. A label is the compact textual identifier
//! for a catchpoint, `"<round>#<base32 digest>"`, advertised on the network
//! and embedded in the archive header. Labels are consensus-observable:
//! equal inputs must yield byte-equal labels, and the three historical
//! formats coexist behind the consensus feature gates.

use crate::types::{encode_msgpack, AccountTotals, Digest, Round};
use data_encoding::BASE32_NOPAD;
use sha2::{Digest as _, Sha512_256};
use std::fmt;

/// The closed set of label formats. Construction picks the newest format
/// the consensus parameters at the block round allow.
#[derive(Clone, Debug)]
pub enum CatchpointLabelMaker<'a> {
    /// Round, block digest, trie balances root and account totals.
    V6 {
        round: Round,
        block_hash: &'a Digest,
        balances_root: &'a Digest,
        totals: &'a AccountTotals,
    },
    /// V6 plus the state proof verification context hash.
    V7 {
        round: Round,
        block_hash: &'a Digest,
        balances_root: &'a Digest,
        totals: &'a AccountTotals,
        sp_verification_hash: &'a Digest,
    },
    /// V7 plus the online-accounts and online-round-params hashes.
    V8 {
        round: Round,
        block_hash: &'a Digest,
        balances_root: &'a Digest,
        totals: &'a AccountTotals,
        sp_verification_hash: &'a Digest,
        online_accounts_hash: &'a Digest,
        online_round_params_hash: &'a Digest,
    },
}

impl<'a> CatchpointLabelMaker<'a> {
    pub fn round(&self) -> Round {
        match self {
            CatchpointLabelMaker::V6 { round, .. }
            | CatchpointLabelMaker::V7 { round, .. }
            | CatchpointLabelMaker::V8 { round, .. } => *round,
        }
    }

    /// The exact byte sequence hashed into the label. Field order is part
    /// of the format and must never change within a version.
    fn buffer(&self) -> Vec<u8> {
        match self {
            CatchpointLabelMaker::V6 {
                block_hash,
                balances_root,
                totals,
                ..
            } => {
                let encoded_totals = encode_msgpack(*totals);
                let mut buf = Vec::with_capacity(64 + encoded_totals.len());
                buf.extend_from_slice(block_hash.as_bytes());
                buf.extend_from_slice(balances_root.as_bytes());
                buf.extend_from_slice(&encoded_totals);
                buf
            }
            CatchpointLabelMaker::V7 {
                block_hash,
                balances_root,
                totals,
                sp_verification_hash,
                ..
            } => {
                let mut buf = CatchpointLabelMaker::V6 {
                    round: self.round(),
                    block_hash: *block_hash,
                    balances_root: *balances_root,
                    totals: *totals,
                }
                .buffer();
                buf.extend_from_slice(sp_verification_hash.as_bytes());
                buf
            }
            CatchpointLabelMaker::V8 {
                block_hash,
                balances_root,
                totals,
                sp_verification_hash,
                online_accounts_hash,
                online_round_params_hash,
                ..
            } => {
                let mut buf = CatchpointLabelMaker::V7 {
                    round: self.round(),
                    block_hash: *block_hash,
                    balances_root: *balances_root,
                    totals: *totals,
                    sp_verification_hash: *sp_verification_hash,
                }
                .buffer();
                buf.extend_from_slice(online_accounts_hash.as_bytes());
                buf.extend_from_slice(online_round_params_hash.as_bytes());
                buf
            }
        }
    }
}

impl fmt::Display for CatchpointLabelMaker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&make_label(self))
    }
}

/// Derives the label string. A pure function of the maker's inputs.
pub fn make_label(maker: &CatchpointLabelMaker<'_>) -> String {
    let mut hasher = Sha512_256::new();
    hasher.update(maker.buffer());
    let hash = hasher.finalize();
    format!("{}#{}", maker.round(), BASE32_NOPAD.encode(&hash))
}
