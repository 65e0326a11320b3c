// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The contract around the merkle trie holding the balances digests, and an
//! in-memory reference implementation backed by committer pages.
//!
//! The trie primitive itself is a black box to the tracker: it only needs
//! add / delete / commit / evict / root-hash. Pages are persisted through a
//! [`TrieCommitter`] that belongs to the current store transaction, so the
//! committer is passed into every operation that may touch storage rather
//! than owned by the trie.

use crate::types::{decode_msgpack, encode_msgpack, Digest, DIGEST_SIZE};
use anyhow::{Context, Result};
use sha2::{Digest as _, Sha512_256};
use std::collections::BTreeSet;

/// Page-granular persistence for trie state, scoped to one store
/// transaction.
pub trait TrieCommitter {
    fn store_page(&mut self, page: u64, content: &[u8]) -> Result<()>;
    fn load_page(&mut self, page: u64) -> Result<Option<Vec<u8>>>;
}

/// Counters reported by a trie commit, logged for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrieCommitStats {
    pub pages_written: usize,
    pub entry_count: usize,
}

/// The balances trie as the tracker sees it.
///
/// `add` / `delete` return whether the digest was newly inserted / actually
/// removed; a `false` return is a soft anomaly the caller logs rather than
/// a failure. `evict` trims the in-memory cache, flushing pending changes
/// first when a committer is supplied. The root hash of an empty trie is
/// the zero digest.
pub trait BalancesTrie: Send + Sync {
    fn add(&mut self, committer: &mut dyn TrieCommitter, digest: &Digest) -> Result<bool>;
    fn delete(&mut self, committer: &mut dyn TrieCommitter, digest: &Digest) -> Result<bool>;
    fn commit(&mut self, committer: &mut dyn TrieCommitter) -> Result<TrieCommitStats>;
    fn evict(&mut self, committer: Option<&mut dyn TrieCommitter>) -> Result<usize>;
    fn root_hash(&mut self, committer: &mut dyn TrieCommitter) -> Result<Digest>;
}

/// Builds fresh trie instances whenever the tracker needs to create or
/// re-attach one.
pub type TrieFactory = std::sync::Arc<dyn Fn() -> Box<dyn BalancesTrie> + Send + Sync>;

/// Returns the factory for the in-crate [`MemoryTrie`].
pub fn memory_trie_factory() -> TrieFactory {
    std::sync::Arc::new(|| Box::new(MemoryTrie::new()) as Box<dyn BalancesTrie>)
}

const ROOT_PAGE: u64 = 0;

/// Reference trie: an ordered digest set persisted as a single committer
/// page, with the root hash folded over the ordered elements. Semantically
/// complete for the tracker's purposes (membership, add/delete symmetry,
/// persistence across restarts) without the paging sophistication of a
/// production trie.
pub struct MemoryTrie {
    cache: Option<BTreeSet<Digest>>,
    dirty: bool,
}

impl MemoryTrie {
    pub fn new() -> Self {
        MemoryTrie {
            cache: None,
            dirty: false,
        }
    }

    fn loaded(&mut self, committer: &mut dyn TrieCommitter) -> Result<&mut BTreeSet<Digest>> {
        if self.cache.is_none() {
            let set = match committer.load_page(ROOT_PAGE)? {
                Some(content) => {
                    let digests: Vec<Digest> =
                        decode_msgpack(&content).context("decoding trie root page")?;
                    digests.into_iter().collect()
                }
                None => BTreeSet::new(),
            };
            self.cache = Some(set);
        }
        Ok(self.cache.as_mut().expect("cache populated above"))
    }
}

impl Default for MemoryTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancesTrie for MemoryTrie {
    fn add(&mut self, committer: &mut dyn TrieCommitter, digest: &Digest) -> Result<bool> {
        let set = self.loaded(committer)?;
        let added = set.insert(*digest);
        self.dirty |= added;
        Ok(added)
    }

    fn delete(&mut self, committer: &mut dyn TrieCommitter, digest: &Digest) -> Result<bool> {
        let set = self.loaded(committer)?;
        let deleted = set.remove(digest);
        self.dirty |= deleted;
        Ok(deleted)
    }

    fn commit(&mut self, committer: &mut dyn TrieCommitter) -> Result<TrieCommitStats> {
        let dirty = self.dirty;
        let set = self.loaded(committer)?;
        let entry_count = set.len();
        if !dirty {
            return Ok(TrieCommitStats {
                pages_written: 0,
                entry_count,
            });
        }
        let digests: Vec<Digest> = set.iter().copied().collect();
        committer.store_page(ROOT_PAGE, &encode_msgpack(&digests))?;
        self.dirty = false;
        Ok(TrieCommitStats {
            pages_written: 1,
            entry_count,
        })
    }

    fn evict(&mut self, committer: Option<&mut dyn TrieCommitter>) -> Result<usize> {
        if self.dirty {
            match committer {
                Some(committer) => {
                    self.commit(committer)?;
                }
                // Nothing to flush against; keep the dirty cache resident
                // rather than losing uncommitted changes.
                None => return Ok(0),
            }
        }
        let evicted = self.cache.as_ref().map(|set| set.len()).unwrap_or(0);
        self.cache = None;
        Ok(evicted)
    }

    fn root_hash(&mut self, committer: &mut dyn TrieCommitter) -> Result<Digest> {
        let set = self.loaded(committer)?;
        if set.is_empty() {
            return Ok(Digest::ZERO);
        }
        let mut hasher = Sha512_256::new();
        hasher.update(b"MT");
        for digest in set.iter() {
            hasher.update(digest.as_bytes());
        }
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Ok(Digest(out))
    }
}
