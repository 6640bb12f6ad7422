/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reading and writing the fork database file.
//!
//! The file is written on clean shutdown and consumed (deleted) on startup; there is no
//! crash-consistency story beyond that. Format, version 1:
//!
//! | Field | Encoding |
//! |---|---|
//! | magic | `u32` LE, distinct per block-state variant |
//! | version | `u32` LE |
//! | root | the root's header state, borsh |
//! | count | varuint (7-bit continuation encoding) |
//! | nodes | `count` block states, borsh |
//! | head_id | 32 bytes |
//!
//! Nodes are written in ascending fork-preference order, merged across the valid and unvalidated
//! ranges of the preference index with valid entries first on ties. Ascending order guarantees
//! every parent precedes its children, which reloading depends on: `open` replays the records
//! through a validated `add`.

use std::fs;
use std::io;
use std::path::Path;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::tree::{ForkDbError, ForkTree, Validator};
use crate::types::basic::BlockId;
use crate::types::block_state::BlockState;

/// Oldest file format version this build can read.
pub const MIN_SUPPORTED_VERSION: u32 = 1;
/// Newest file format version this build can read; also the version it writes.
pub const MAX_SUPPORTED_VERSION: u32 = 1;

impl<V: BlockState> ForkTree<V> {
    /// Serialize the whole tree to `fork_db_file` and clear the index.
    ///
    /// If no root is set nothing is written; a non-empty index without a root is logged as
    /// corruption and likewise not written.
    pub fn close(&self, fork_db_file: &Path) -> Result<(), ForkDbError> {
        let mut state = self.lock();

        let root = match &state.root {
            Some(root) => root.clone(),
            None => {
                if !state.index.is_empty() {
                    log::error!(
                        "fork database is in a bad state when closing; not writing out '{}'",
                        fork_db_file.display()
                    );
                }
                return Ok(());
            }
        };

        let num_blocks = state.index.len();
        let mut out: Vec<u8> = Vec::new();
        V::MAGIC.serialize(&mut out)?;
        MAX_SUPPORTED_VERSION.serialize(&mut out)?;
        root.header_state().serialize(&mut out)?;
        write_varuint(&mut out, num_blocks as u64);

        // Merge the two preference ranges from least preferred upwards, always writing the less
        // preferred front first and the valid entry on ties.
        let mut validated = state.index.validated_keys().rev().peekable();
        let mut unvalidated = state.index.unvalidated_keys().rev().peekable();
        loop {
            let take_unvalidated = match (validated.peek(), unvalidated.peek()) {
                (None, None) => break,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some(v), Some(u)) => v.first_preferred_over(u),
            };
            let key = if take_unvalidated {
                unvalidated.next()
            } else {
                validated.next()
            };
            let Some(key) = key else { break };
            state.index.resolve(key).as_ref().serialize(&mut out)?;
        }
        drop(validated);
        drop(unvalidated);

        match &state.head {
            Some(head) => head.id().serialize(&mut out)?,
            None => log::error!(
                "head not set in fork database; '{}' will be corrupted",
                fork_db_file.display()
            ),
        }

        fs::write(fork_db_file, &out)?;
        crate::logging::log_close(fork_db_file, num_blocks);

        state.index.clear();
        Ok(())
    }

    /// Restore the tree from `fork_db_file`, if it exists, and delete the file.
    ///
    /// Every stored node is replayed through a validated `add`, so a reloaded tree satisfies
    /// the same invariants as a live one; `validator` sees every stored feature activation. On
    /// a [`ForkDbError::Corrupt`] failure the tree is left as reconstructed up to the failure
    /// point and the file is kept.
    pub fn open(&self, fork_db_file: &Path, validator: &mut Validator) -> Result<(), ForkDbError> {
        if !fork_db_file.exists() {
            return Ok(());
        }
        let content = fs::read(fork_db_file)?;
        let mut ds: &[u8] = &content;

        let magic = u32::deserialize(&mut ds)?;
        if magic != V::MAGIC {
            return Err(ForkDbError::BadMagic { actual: magic });
        }
        let version = u32::deserialize(&mut ds)?;
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
            return Err(ForkDbError::UnsupportedVersion {
                version,
                min: MIN_SUPPORTED_VERSION,
                max: MAX_SUPPORTED_VERSION,
            });
        }

        let root_header_state = V::HeaderState::deserialize(&mut ds)?;

        let mut state = self.lock();
        Self::reset_impl(&mut state, root_header_state);
        let root = match &state.root {
            Some(root) => root.clone(),
            None => {
                return Err(ForkDbError::Corrupt {
                    reason: "root missing right after reset",
                })
            }
        };

        let size = read_varuint(&mut ds)?;
        for _ in 0..size {
            let mut node = V::deserialize(&mut ds)?;
            node.rebuild_header_exts()?;
            Self::add_impl(&mut state, std::sync::Arc::new(node), false, true, validator)?;
        }

        let head_id = BlockId::deserialize(&mut ds)?;
        let head = if root.id() == head_id {
            root.clone()
        } else {
            state
                .index
                .get(&head_id)
                .cloned()
                .ok_or(ForkDbError::Corrupt {
                    reason: "could not find head while reconstructing fork database",
                })?
        };
        state.head = Some(head.clone());

        match state.index.best() {
            Some(candidate) if candidate.is_valid() => {
                if crate::index::first_preferred(candidate.as_ref(), head.as_ref()) {
                    return Err(ForkDbError::Corrupt {
                        reason: "head not set to best available option",
                    });
                }
            }
            _ => {
                if head.id() != root.id() {
                    return Err(ForkDbError::Corrupt {
                        reason: "head not set to root despite no better option available",
                    });
                }
            }
        }

        fs::remove_file(fork_db_file)?;
        crate::logging::log_open(fork_db_file, size as usize);
        Ok(())
    }
}

/// Append `value` in the 7-bit continuation encoding.
pub(crate) fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read a 7-bit-continuation-encoded integer off the front of `ds`.
pub(crate) fn read_varuint(ds: &mut &[u8]) -> io::Result<u64> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = u8::deserialize(ds)?;
        if shift == 63 && byte > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varuint does not fit in 64 bits",
            ));
        }
        out |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varuint does not fit in 64 bits",
            ));
        }
    }
}
