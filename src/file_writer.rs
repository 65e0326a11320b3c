// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The first-stage data file producer.
//!
//! Streams the account rows and key-value rows of a store snapshot into a
//! tar stream framed with the fast (snappy) compressor, one bounded chunk
//! per cooperative [`CatchpointFileWriter::write_step`] call. The archive
//! header entry is *not* written here — the label it contains is only known
//! at the second stage, which prepends it during repacking.

use crate::{
    errors::CatchpointError,
    store::SnapshotScope,
    types::{encode_msgpack, BalancesChunk},
    utils::CancelToken,
};
use anyhow::{anyhow, Context, Result};
use snap::write::FrameEncoder;
use std::{
    fs::{self, File},
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    time::Instant,
};

/// Name of the archive entry holding the catchpoint file header.
pub const CATCHPOINT_CONTENT_FILE_NAME: &str = "content.msgpack";
/// Name of the archive entry holding the state proof verification data.
pub const CATCHPOINT_SP_VERIFICATION_FILE_NAME: &str = "stateProofVerificationContext.msgpack";

/// Name of the `n`-th balances chunk entry.
pub fn balances_chunk_name(n: u64) -> String {
    format!("balances.{}.msgpack", n)
}

/// Counters describing a finished data file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileWriterStats {
    pub total_accounts: u64,
    pub total_kvs: u64,
    pub total_chunks: u64,
    /// Longest (uncompressed) entry written, header entries included.
    pub biggest_chunk_len: u64,
    /// Size of the finished file on disk.
    pub written_bytes: u64,
}

type TarStream = tar::Builder<FrameEncoder<BufWriter<File>>>;

/// Writes one first-stage data file. Dropping the writer without
/// [`finish`](Self::finish) leaves a partial file behind; call
/// [`abort`](Self::abort) to remove it.
pub struct CatchpointFileWriter<'a> {
    path: PathBuf,
    tar: Option<TarStream>,
    balances: crate::store::RowIter<'a, crate::types::EncodedBalanceRecord>,
    kvs: crate::store::RowIter<'a, crate::types::EncodedKvRecord>,
    balances_done: bool,
    kvs_done: bool,
    pending: BalancesChunk,
    max_records_per_chunk: usize,
    stats: FileWriterStats,
}

impl<'a> CatchpointFileWriter<'a> {
    pub fn new(
        path: impl Into<PathBuf>,
        snapshot: &'a dyn SnapshotScope,
        max_records_per_chunk: usize,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating data file directory {:?}", parent))?;
        }
        let file =
            File::create(&path).with_context(|| format!("creating data file {:?}", path))?;
        let tar = tar::Builder::new(FrameEncoder::new(BufWriter::new(file)));
        Ok(CatchpointFileWriter {
            path,
            tar: Some(tar),
            balances: snapshot.balance_records(),
            kvs: snapshot.kv_records(),
            balances_done: false,
            kvs_done: false,
            pending: BalancesChunk::default(),
            max_records_per_chunk: max_records_per_chunk.max(1),
            stats: FileWriterStats::default(),
        })
    }

    fn tar_mut(&mut self) -> Result<&mut TarStream> {
        self.tar
            .as_mut()
            .ok_or_else(|| anyhow!("data file writer already finished"))
    }

    fn append_entry(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let len = content.len() as u64;
        let mut header = tar::Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o600);
        self.tar_mut()?
            .append_data(&mut header, name, content)
            .with_context(|| format!("appending archive entry '{}'", name))?;
        if len > self.stats.biggest_chunk_len {
            self.stats.biggest_chunk_len = len;
        }
        Ok(())
    }

    /// Writes the state proof verification context entry. Must precede the
    /// balance chunks; omitted entirely for legacy (V6) files.
    pub fn write_sp_verification_context(&mut self, encoded: &[u8]) -> Result<()> {
        self.append_entry(CATCHPOINT_SP_VERIFICATION_FILE_NAME, encoded)
    }

    fn flush_pending_chunk(&mut self) -> Result<()> {
        let chunk = std::mem::take(&mut self.pending);
        let encoded = encode_msgpack(&chunk);
        let name = balances_chunk_name(self.stats.total_chunks);
        self.append_entry(&name, &encoded)?;
        self.stats.total_chunks += 1;
        Ok(())
    }

    /// Performs one bounded unit of work: accumulates rows until a chunk
    /// fills (writing it) or the deadline passes (carrying the partial
    /// buffer into the next step). Returns whether more work remains; the
    /// final step seals the stream and reports `false`.
    pub fn write_step(&mut self, deadline: Instant, cancel: &CancelToken) -> Result<bool> {
        loop {
            if cancel.is_cancelled() {
                return Err(CatchpointError::Cancelled.into());
            }

            if !self.balances_done {
                match self.balances.next() {
                    Some(record) => {
                        self.pending.balances.push(record?);
                        self.stats.total_accounts += 1;
                    }
                    None => self.balances_done = true,
                }
            } else if !self.kvs_done {
                match self.kvs.next() {
                    Some(record) => {
                        self.pending.kvs.push(record?);
                        self.stats.total_kvs += 1;
                    }
                    None => self.kvs_done = true,
                }
            } else {
                if !self.pending.is_empty() {
                    self.flush_pending_chunk()?;
                }
                self.finish()?;
                return Ok(false);
            }

            if self.pending.len() >= self.max_records_per_chunk {
                self.flush_pending_chunk()?;
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        let tar = self
            .tar
            .take()
            .ok_or_else(|| anyhow!("data file writer already finished"))?;
        // Writes the archive terminator, then pushes the buffered tail
        // through the compressor and buffer down to the file.
        let mut encoder = tar.into_inner().context("sealing data file archive")?;
        encoder.flush().context("flushing stage-1 compressor")?;
        drop(encoder);
        self.stats.written_bytes = fs::metadata(&self.path)
            .with_context(|| format!("reading back data file size {:?}", self.path))?
            .len();
        Ok(())
    }

    /// Drops the stream and deletes the partial file.
    pub fn abort(&mut self) -> Result<()> {
        self.tar = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing data file {:?}", self.path)),
        }
    }

    /// Counters; meaningful once `write_step` has returned `false`.
    pub fn stats(&self) -> FileWriterStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every chunk of a stage-1 data file back, in order. Test and
/// verification support.
pub fn read_data_file(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(path).with_context(|| format!("opening data file {:?}", path))?;
    let mut archive = tar::Archive::new(snap::read::FrameDecoder::new(file));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::with_capacity(entry.header().size()? as usize);
        std::io::Read::read_to_end(&mut entry, &mut content)?;
        entries.push((name, content));
    }
    Ok(entries)
}
