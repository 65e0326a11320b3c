// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pure round arithmetic deciding where the two catchpoint stages fall
//! inside a committed-round window.
//!
//! A catchpoint for a block at round `R` is anchored to the accounts round
//! `A = R - lookback`: the first stage runs when `A` becomes the committed
//! base, the second stage when `R` does.

use crate::types::Round;

/// Decides whether the window `(old_base, old_base + offset]` contains
/// first-stage (accounts) rounds, i.e. rounds `r` with
/// `(r + lookback) % interval == 0` at or after the re-enable boundary.
///
/// Returns whether at least one such round exists, whether more than one
/// exists, and the offset narrowed so the committed base lands exactly on
/// the *latest* such round — when several pile up, the earlier ones are
/// deliberately skipped.
pub fn calculate_first_stage_rounds(
    old_base: Round,
    offset: u64,
    reenable_catchpoints_round: Round,
    catchpoint_interval: u64,
    catchpoint_lookback: u64,
) -> (bool, bool, u64) {
    let mut new_offset = offset;

    if reenable_catchpoints_round == 0 {
        return (false, false, new_offset);
    }

    let mut min_first_stage_round = old_base + 1;
    if reenable_catchpoints_round > catchpoint_lookback
        && reenable_catchpoints_round - catchpoint_lookback > min_first_stage_round
    {
        min_first_stage_round = reenable_catchpoints_round - catchpoint_lookback;
    }

    // The smallest r >= min_first_stage_round with
    // (r + lookback) % interval == 0, and the largest such r <= old_base +
    // offset. Signed arithmetic: the floor multiple may fall below the
    // lookback.
    let interval = catchpoint_interval as i64;
    let lookback = catchpoint_lookback as i64;
    let first = (min_first_stage_round as i64 + lookback + interval - 1) / interval * interval
        - lookback;
    let last = ((old_base + offset) as i64 + lookback) / interval * interval - lookback;

    let mut has_first_stage_round = false;
    let mut has_multiple_first_stage_rounds = false;
    if first <= last {
        has_first_stage_round = true;
        new_offset = last as u64 - old_base;
        if first < last {
            has_multiple_first_stage_rounds = true;
        }
    }
    (
        has_first_stage_round,
        has_multiple_first_stage_rounds,
        new_offset,
    )
}

/// All multiples of `catchpoint_interval` in `[min, max]`. These are the
/// block rounds receiving a second-stage pass. `catchpoint_interval` must
/// be non-zero.
pub fn calculate_catchpoint_rounds(
    min: Round,
    max: Round,
    catchpoint_interval: u64,
) -> Vec<Round> {
    // The smallest i with i * interval >= min, the largest with
    // i * interval <= max; e.g. min=11, max=19, interval=10 has none.
    let l = (min + catchpoint_interval - 1) / catchpoint_interval;
    let r = max / catchpoint_interval;
    if l > r {
        return Vec::new();
    }
    (l..=r).map(|i| i * catchpoint_interval).collect()
}
