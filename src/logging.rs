/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out fork database events.
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate; set up a logging
//! implementation to get the messages printed to a terminal or a file.
//!
//! Log messages are CSVs with at least two values. The first two are always the event name in
//! PascalCase and the time the event was emitted (seconds since the Unix Epoch). Block ids are
//! printed as the first seven characters of their Base64 encoding.

use std::path::Path;
use std::time::SystemTime;

use crate::types::basic::{BlockId, BlockNum};

// Names of each event in PascalCase for printing:
pub const OPEN_FORK_DB: &str = "OpenForkDb";
pub const CLOSE_FORK_DB: &str = "CloseForkDb";
pub const ADVANCE_ROOT: &str = "AdvanceRoot";
pub const SWITCH_FORK_DB: &str = "SwitchForkDb";

fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub(crate) fn log_open(fork_db_file: &Path, num_blocks: usize) {
    log::info!(
        "{}, {}, {}, {}",
        OPEN_FORK_DB,
        secs_since_unix_epoch(),
        fork_db_file.display(),
        num_blocks,
    );
}

pub(crate) fn log_close(fork_db_file: &Path, num_blocks: usize) {
    log::info!(
        "{}, {}, {}, {}",
        CLOSE_FORK_DB,
        secs_since_unix_epoch(),
        fork_db_file.display(),
        num_blocks,
    );
}

pub(crate) fn log_advance_root(id: &BlockId, block_num: BlockNum) {
    log::debug!(
        "{}, {}, {}, {}",
        ADVANCE_ROOT,
        secs_since_unix_epoch(),
        id.short(),
        block_num,
    );
}

pub(crate) fn log_switch_from_legacy(id: &BlockId, block_num: BlockNum) {
    log::info!(
        "{}, {}, {}, {}",
        SWITCH_FORK_DB,
        secs_since_unix_epoch(),
        id.short(),
        block_num,
    );
}
