// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error kinds callers are expected to match on. Everything else travels as
//! `anyhow::Error` with context attached at the failure site.

use crate::types::Round;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatchpointError {
    /// No catchpoint file is available for the requested round.
    #[error("no catchpoint entry for round {0}")]
    NoEntry(Round),

    /// The V8 file format requires the V7 features to be enabled as well;
    /// hitting this means the consensus parameters are inconsistent.
    #[error("invalid params for catchpoint file version v8: SP contexts not enabled")]
    VersionMisconfiguration,

    /// A tar entry's content did not match its declared size during repack.
    #[error("tar entry '{name}': read {read} bytes, header declares {declared}")]
    EntrySizeMismatch {
        name: String,
        read: u64,
        declared: u64,
    },

    /// A commit range was delivered out of order.
    #[error("commit range for base {old_base} offset {offset} delivered out of order")]
    UnorderedCommit { old_base: Round, offset: u64 },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}
