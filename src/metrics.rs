// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge,
};

pub static CATCHPOINT_DATA_FILES_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "catchpoint_data_files_written",
        "Number of first-stage catchpoint data files generated."
    )
    .unwrap()
});

pub static CATCHPOINT_FILES_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "catchpoint_files_created",
        "Number of finished catchpoint archives produced."
    )
    .unwrap()
});

pub static CATCHPOINT_STREAM_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "catchpoint_stream_requests",
        "Number of catchpoint file stream requests served or attempted."
    )
    .unwrap()
});

pub static CATCHPOINT_LAST_FIRST_STAGE_ROUND: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "catchpoint_last_first_stage_round",
        "Accounts round of the most recently completed first stage."
    )
    .unwrap()
});

pub static CATCHPOINT_LAST_CATCHPOINT_ROUND: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "catchpoint_last_catchpoint_round",
        "Block round of the most recently finished catchpoint."
    )
    .unwrap()
});
