// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Second-stage archive assembly: re-encodes a stage-1 data file (fast
//! compressor) into the public catchpoint archive (portable compressor),
//! prepending the finalized header — which could only be built once the
//! block round's digest and label were known.

use crate::{
    errors::CatchpointError,
    file_writer::CATCHPOINT_CONTENT_FILE_NAME,
    types::{encode_msgpack, CatchpointFileHeader},
    utils::CancelToken,
};
use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use snap::read::FrameDecoder;
use std::{
    fs::{self, File},
    io::{BufWriter, Read, Write},
    path::Path,
};

/// Rewrites the stage-1 stream at `data_path` into the final archive at
/// `out_path`: a gzip tar whose first entry is the header, followed by
/// every stage-1 entry copied verbatim. A failed or cancelled repack
/// removes the partial output.
pub fn repack_catchpoint(
    cancel: &CancelToken,
    header: &CatchpointFileHeader,
    biggest_chunk_len: u64,
    data_path: &Path,
    out_path: &Path,
) -> Result<()> {
    let result = do_repack(cancel, header, biggest_chunk_len, data_path, out_path);
    if result.is_err() {
        let _ = fs::remove_file(out_path);
    }
    result
}

fn do_repack(
    cancel: &CancelToken,
    header: &CatchpointFileHeader,
    biggest_chunk_len: u64,
    data_path: &Path,
    out_path: &Path,
) -> Result<()> {
    let fin = File::open(data_path)
        .with_context(|| format!("opening stage-1 data file {:?}", data_path))?;
    let mut tar_in = tar::Archive::new(FrameDecoder::new(fin));

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating catchpoint directory {:?}", parent))?;
    }
    let fout = File::create(out_path)
        .with_context(|| format!("creating catchpoint file {:?}", out_path))?;
    let gz = GzEncoder::new(BufWriter::new(fout), Compression::fast());
    let mut tar_out = tar::Builder::new(gz);

    let encoded_header = encode_msgpack(header);
    let mut content_header = tar::Header::new_gnu();
    content_header.set_size(encoded_header.len() as u64);
    content_header.set_mode(0o600);
    tar_out
        .append_data(
            &mut content_header,
            CATCHPOINT_CONTENT_FILE_NAME,
            encoded_header.as_slice(),
        )
        .context("writing catchpoint header entry")?;

    // One reusable buffer sized for the biggest recorded chunk.
    let mut buf = vec![0u8; biggest_chunk_len as usize];
    for entry in tar_in.entries().context("reading stage-1 archive")? {
        if cancel.is_cancelled() {
            return Err(CatchpointError::Cancelled.into());
        }
        let mut entry = entry?;
        let declared = entry.header().size()?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if declared as usize > buf.len() {
            buf.resize(declared as usize, 0);
        }
        let chunk = &mut buf[..declared as usize];
        let mut read = 0usize;
        while read < chunk.len() {
            match entry.read(&mut chunk[read..])? {
                0 => break,
                n => read += n,
            }
        }
        if read as u64 != declared {
            return Err(CatchpointError::EntrySizeMismatch {
                name,
                read: read as u64,
                declared,
            }
            .into());
        }

        let mut out_header = entry.header().clone();
        tar_out
            .append_data(&mut out_header, &name, &chunk[..])
            .with_context(|| format!("copying archive entry '{}'", name))?;
    }

    let gz = tar_out
        .into_inner()
        .context("sealing catchpoint archive")?;
    let mut writer = gz.finish().context("finishing gzip stream")?;
    writer.flush().context("flushing catchpoint file")?;
    Ok(())
}

/// Reads every entry of a finished catchpoint archive, in order. Test and
/// verification support.
pub fn read_catchpoint_file(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file =
        File::open(path).with_context(|| format!("opening catchpoint file {:?}", path))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::with_capacity(entry.header().size()? as usize);
        entry.read_to_end(&mut content)?;
        entries.push((name, content));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file_writer::{CatchpointFileWriter, CATCHPOINT_SP_VERIFICATION_FILE_NAME},
        store::{memory::MemoryStore, TrackerStore},
        types::{decode_msgpack, AccountData, Digest},
    };
    use std::time::{Duration, Instant};

    fn write_data_file(path: &Path, accounts: usize) -> u64 {
        let store = MemoryStore::new();
        for i in 0..accounts {
            let mut address = [0u8; 32];
            address[0] = i as u8;
            store.set_account(
                address,
                AccountData {
                    status: 1,
                    micro_balance: i as u64,
                    rewards_base: 0,
                    update_round: 1,
                },
            );
        }
        store.set_kv(b"kv".to_vec(), Some(b"value".to_vec()));
        let snapshot = store.begin_snapshot().unwrap();
        let cancel = CancelToken::new();
        let mut writer = CatchpointFileWriter::new(path, snapshot.as_ref(), 3).unwrap();
        writer.write_sp_verification_context(b"sp-bytes").unwrap();
        let deadline = Instant::now() + Duration::from_secs(60);
        while writer.write_step(deadline, &cancel).unwrap() {}
        writer.stats().biggest_chunk_len
    }

    fn sample_header() -> CatchpointFileHeader {
        CatchpointFileHeader {
            version: crate::tracker::CATCHPOINT_FILE_VERSION_V7,
            balances_round: 80,
            blocks_round: 400,
            total_accounts: 7,
            total_kvs: 1,
            total_chunks: 3,
            catchpoint: "400#LABEL".to_string(),
            block_header_digest: Digest([6u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn repack_prepends_header_and_copies_entries() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("80.data");
        let out_path = dir.path().join("400.catchpoint");
        let biggest = write_data_file(&data_path, 7);

        let header = sample_header();
        let cancel = CancelToken::new();
        repack_catchpoint(&cancel, &header, biggest, &data_path, &out_path).unwrap();

        let stage1 = crate::file_writer::read_data_file(&data_path).unwrap();
        let finished = read_catchpoint_file(&out_path).unwrap();
        assert_eq!(finished.len(), stage1.len() + 1);
        assert_eq!(finished[0].0, CATCHPOINT_CONTENT_FILE_NAME);
        let decoded: CatchpointFileHeader = decode_msgpack(&finished[0].1).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(finished[1].0, CATCHPOINT_SP_VERIFICATION_FILE_NAME);
        for ((name, content), (orig_name, orig_content)) in
            finished[1..].iter().zip(stage1.iter())
        {
            assert_eq!(name, orig_name);
            assert_eq!(content, orig_content);
        }
    }

    #[test]
    fn cancelled_repack_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("80.data");
        let out_path = dir.path().join("400.catchpoint");
        let biggest = write_data_file(&data_path, 4);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = repack_catchpoint(&cancel, &sample_header(), biggest, &data_path, &out_path)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatchpointError>(),
            Some(CatchpointError::Cancelled)
        ));
        assert!(!out_path.exists());
    }

    #[test]
    fn missing_data_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let err = repack_catchpoint(
            &cancel,
            &sample_header(),
            0,
            &dir.path().join("absent.data"),
            &dir.path().join("out.catchpoint"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("absent.data"));
    }
}
