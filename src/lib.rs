/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A multi-indexed, persistent fork database.
//!
//! The fork database tracks every candidate extension of a blockchain beyond its last finalized
//! block and selects the current head under a well-defined fork-choice rule. It supports a chain
//! with a mutating protocol: a legacy fork-choice regime driven by a delegated-proof-of-stake
//! irreversibility number, and an instant-finality regime that supersedes it. Full state is
//! persisted to a single file on clean shutdown and restored (and the file consumed) on startup.
//!
//! Start at [`ForkDatabase`](database::ForkDatabase) for the two-variant facade, or at
//! [`ForkTree`](tree::ForkTree) for a tree over a single block-state variant.

pub mod database;

pub mod persistence;

pub mod tree;

pub mod types;

pub mod logging;

pub(crate) mod index;

// Re-exports
pub use database::{BlockHeaderStateHandle, BlockStateHandle, ForkDatabase, FORK_DB_FILENAME};
pub use index::first_preferred;
pub use tree::{Branch, ForkDbError, ForkTree, Validator};
