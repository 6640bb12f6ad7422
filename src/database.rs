/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fork database facade: one surface over the two block-state variants.
//!
//! A [`ForkDatabase`] starts in the legacy (DPoS) regime and owns a fork tree of
//! [`LegacyBlockState`]s. The instant-finality tree is created at most once: either because
//! [`open`](ForkDatabase::open) found an instant-finality file on disk, or because the driver
//! performed the one-way [`switch_from_legacy`](ForkDatabase::switch_from_legacy). Every
//! operation dispatches to the active tree at the call site through the
//! [`BlockStateHandle`] / [`BlockHeaderStateHandle`] sum types.
//!
//! ## The migration window
//!
//! After the switch, callers stop issuing writes to the legacy tree, but other threads may
//! still be blocked on its mutex or hold references into it. The retired tree is therefore
//! kept alive for the remaining lifetime of the process. It is simply never written to again,
//! and [`close`](ForkDatabase::close) only writes the active tree's file.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::logging;
use crate::tree::{Branch, ForkDbError, ForkTree, Validator};
use crate::types::basic::{BlockId, BlockNum, Timestamp};
use crate::types::block::Block;
use crate::types::block_state::{
    BlockState, IfBlockHeaderState, IfBlockState, LegacyBlockHeaderState, LegacyBlockState,
};

/// Name of the fork database file inside the data directory.
pub const FORK_DB_FILENAME: &str = "fork_db.dat";

/// A shared block state of whichever variant produced it.
#[derive(Clone)]
pub enum BlockStateHandle {
    Legacy(Arc<LegacyBlockState>),
    InstantFinality(Arc<IfBlockState>),
}

impl BlockStateHandle {
    pub fn id(&self) -> BlockId {
        match self {
            BlockStateHandle::Legacy(n) => n.id(),
            BlockStateHandle::InstantFinality(n) => n.id(),
        }
    }

    pub fn previous(&self) -> BlockId {
        match self {
            BlockStateHandle::Legacy(n) => n.previous(),
            BlockStateHandle::InstantFinality(n) => n.previous(),
        }
    }

    pub fn block_num(&self) -> BlockNum {
        match self {
            BlockStateHandle::Legacy(n) => n.block_num(),
            BlockStateHandle::InstantFinality(n) => n.block_num(),
        }
    }

    pub fn irreversibility_num(&self) -> BlockNum {
        match self {
            BlockStateHandle::Legacy(n) => n.irreversibility_num(),
            BlockStateHandle::InstantFinality(n) => n.irreversibility_num(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            BlockStateHandle::Legacy(n) => n.timestamp(),
            BlockStateHandle::InstantFinality(n) => n.timestamp(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            BlockStateHandle::Legacy(n) => n.is_valid(),
            BlockStateHandle::InstantFinality(n) => n.is_valid(),
        }
    }

    pub fn block(&self) -> Option<&Arc<Block>> {
        match self {
            BlockStateHandle::Legacy(n) => n.block(),
            BlockStateHandle::InstantFinality(n) => n.block(),
        }
    }
}

/// A header state of whichever variant produced it. Input to [`ForkDatabase::reset`].
#[derive(Clone)]
pub enum BlockHeaderStateHandle {
    Legacy(LegacyBlockHeaderState),
    InstantFinality(IfBlockHeaderState),
}

/// The fork database: dispatches every operation to the active variant's fork tree and owns
/// the legacy → instant-finality migration.
pub struct ForkDatabase {
    data_dir: PathBuf,
    legacy: AtomicBool,
    // Constructed up front: the chain head is accessed before the fork database is opened.
    fork_db_legacy: ForkTree<LegacyBlockState>,
    fork_db_if: OnceLock<ForkTree<IfBlockState>>,
}

impl ForkDatabase {
    /// Create a fork database storing its file under `data_dir`, in the legacy regime with an
    /// empty tree.
    pub fn new(data_dir: impl Into<PathBuf>) -> ForkDatabase {
        ForkDatabase {
            data_dir: data_dir.into(),
            legacy: AtomicBool::new(true),
            fork_db_legacy: ForkTree::new(),
            fork_db_if: OnceLock::new(),
        }
    }

    /// Whether the legacy tree is still the active one.
    pub fn is_legacy(&self) -> bool {
        self.legacy.load(Ordering::Acquire)
    }

    fn fork_db_file(&self) -> PathBuf {
        self.data_dir.join(FORK_DB_FILENAME)
    }

    fn if_tree(&self) -> &ForkTree<IfBlockState> {
        self.fork_db_if
            .get()
            .expect("instant-finality fork database not constructed")
    }

    /// Typed access to the legacy tree. Valid at any time; stale (read-only by convention)
    /// after the switch.
    pub fn legacy_fork_db(&self) -> &ForkTree<LegacyBlockState> {
        &self.fork_db_legacy
    }

    /// Typed access to the instant-finality tree, once it exists.
    pub fn if_fork_db(&self) -> Option<&ForkTree<IfBlockState>> {
        self.fork_db_if.get()
    }

    /// Restore state from the fork database file, if one exists, dispatching on the file's
    /// magic number: a legacy file loads into the legacy tree, an instant-finality file
    /// constructs the instant-finality tree and makes it active. The file is deleted once
    /// loaded. With no file, the database stays legacy and empty.
    pub fn open(&self, validator: &mut Validator) -> Result<(), ForkDbError> {
        if !self.data_dir.is_dir() {
            fs::create_dir_all(&self.data_dir)?;
        }
        let fork_db_file = self.fork_db_file();
        if !fork_db_file.exists() {
            return Ok(());
        }

        let magic = peek_magic(&fork_db_file)?;
        if magic == LegacyBlockState::MAGIC {
            self.fork_db_legacy.open(&fork_db_file, validator)
        } else if magic == IfBlockState::MAGIC {
            let tree = self.fork_db_if.get_or_init(ForkTree::new);
            self.legacy.store(false, Ordering::Release);
            tree.open(&fork_db_file, validator)
        } else {
            Err(ForkDbError::BadMagic { actual: magic })
        }
    }

    /// Write the active tree's state out to the fork database file.
    pub fn close(&self) -> Result<(), ForkDbError> {
        let fork_db_file = self.fork_db_file();
        if self.is_legacy() {
            self.fork_db_legacy.close(&fork_db_file)
        } else {
            self.if_tree().close(&fork_db_file)
        }
    }

    /// Leave the legacy regime: reinterpret the legacy chain head as the first
    /// instant-finality block state, construct the instant-finality tree around it, and make
    /// that tree active.
    ///
    /// The legacy tree is not written out (its file, if any, was removed on open) and not
    /// destroyed: outstanding readers may still be using it.
    ///
    /// # Panics
    ///
    /// Panics if the switch has already happened.
    pub fn switch_from_legacy(&self) -> Result<(), ForkDbError> {
        assert!(
            self.is_legacy(),
            "fork database has already switched to instant finality"
        );
        let legacy_head = self
            .fork_db_legacy
            .chain_head()
            .ok_or(ForkDbError::ChainHeadNotSet)?;
        let new_head = Arc::new(IfBlockState::from_legacy(&legacy_head));

        let tree = self.fork_db_if.get_or_init(ForkTree::new);
        self.legacy.store(false, Ordering::Release);
        tree.set_chain_head(Some(new_head.clone()));
        tree.reset(new_head.header_state().clone());

        logging::log_switch_from_legacy(&new_head.id(), new_head.block_num());
        Ok(())
    }

    /// Discard all state of the active tree and install a new root.
    pub fn reset(&self, root_header_state: BlockHeaderStateHandle) -> Result<(), ForkDbError> {
        match (self.is_legacy(), root_header_state) {
            (true, BlockHeaderStateHandle::Legacy(hs)) => {
                self.fork_db_legacy.reset(hs);
                Ok(())
            }
            (false, BlockHeaderStateHandle::InstantFinality(hs)) => {
                self.if_tree().reset(hs);
                Ok(())
            }
            _ => Err(ForkDbError::VariantMismatch),
        }
    }

    pub fn add(&self, n: BlockStateHandle, ignore_duplicate: bool) -> Result<(), ForkDbError> {
        match (self.is_legacy(), n) {
            (true, BlockStateHandle::Legacy(n)) => self.fork_db_legacy.add(n, ignore_duplicate),
            (false, BlockStateHandle::InstantFinality(n)) => {
                self.if_tree().add(n, ignore_duplicate)
            }
            _ => Err(ForkDbError::VariantMismatch),
        }
    }

    pub fn mark_valid(&self, n: &BlockStateHandle) -> Result<(), ForkDbError> {
        match (self.is_legacy(), n) {
            (true, BlockStateHandle::Legacy(n)) => self.fork_db_legacy.mark_valid(n),
            (false, BlockStateHandle::InstantFinality(n)) => self.if_tree().mark_valid(n),
            _ => Err(ForkDbError::VariantMismatch),
        }
    }

    pub fn rollback_head_to_root(&self) {
        if self.is_legacy() {
            self.fork_db_legacy.rollback_head_to_root()
        } else {
            self.if_tree().rollback_head_to_root()
        }
    }

    pub fn advance_root(&self, id: BlockId) -> Result<(), ForkDbError> {
        if self.is_legacy() {
            self.fork_db_legacy.advance_root(id)
        } else {
            self.if_tree().advance_root(id)
        }
    }

    pub fn remove(&self, id: BlockId) -> Result<(), ForkDbError> {
        if self.is_legacy() {
            self.fork_db_legacy.remove(id)
        } else {
            self.if_tree().remove(id)
        }
    }

    pub fn get_block(&self, id: &BlockId) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy.get_block(id).map(BlockStateHandle::Legacy)
        } else {
            self.if_tree()
                .get_block(id)
                .map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn get_block_header(&self, id: &BlockId) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy
                .get_block_header(id)
                .map(BlockStateHandle::Legacy)
        } else {
            self.if_tree()
                .get_block_header(id)
                .map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn root(&self) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy.root().map(BlockStateHandle::Legacy)
        } else {
            self.if_tree().root().map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn head(&self) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy.head().map(BlockStateHandle::Legacy)
        } else {
            self.if_tree().head().map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn pending_head(&self) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy
                .pending_head()
                .map(BlockStateHandle::Legacy)
        } else {
            self.if_tree()
                .pending_head()
                .map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn chain_head(&self) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy
                .chain_head()
                .map(BlockStateHandle::Legacy)
        } else {
            self.if_tree()
                .chain_head()
                .map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn set_chain_head(&self, n: BlockStateHandle) -> Result<(), ForkDbError> {
        match (self.is_legacy(), n) {
            (true, BlockStateHandle::Legacy(n)) => {
                self.fork_db_legacy.set_chain_head(Some(n));
                Ok(())
            }
            (false, BlockStateHandle::InstantFinality(n)) => {
                self.if_tree().set_chain_head(Some(n));
                Ok(())
            }
            _ => Err(ForkDbError::VariantMismatch),
        }
    }

    pub fn fetch_branch(
        &self,
        h: BlockId,
        trim_after_block_num: BlockNum,
    ) -> Vec<BlockStateHandle> {
        if self.is_legacy() {
            wrap_branch(
                self.fork_db_legacy.fetch_branch(h, trim_after_block_num),
                BlockStateHandle::Legacy,
            )
        } else {
            wrap_branch(
                self.if_tree().fetch_branch(h, trim_after_block_num),
                BlockStateHandle::InstantFinality,
            )
        }
    }

    pub fn search_on_branch(&self, h: BlockId, block_num: BlockNum) -> Option<BlockStateHandle> {
        if self.is_legacy() {
            self.fork_db_legacy
                .search_on_branch(h, block_num)
                .map(BlockStateHandle::Legacy)
        } else {
            self.if_tree()
                .search_on_branch(h, block_num)
                .map(BlockStateHandle::InstantFinality)
        }
    }

    pub fn fetch_branch_from(
        &self,
        first: BlockId,
        second: BlockId,
    ) -> Result<(Vec<BlockStateHandle>, Vec<BlockStateHandle>), ForkDbError> {
        if self.is_legacy() {
            let (left, right) = self.fork_db_legacy.fetch_branch_from(first, second)?;
            Ok((
                wrap_branch(left, BlockStateHandle::Legacy),
                wrap_branch(right, BlockStateHandle::Legacy),
            ))
        } else {
            let (left, right) = self.if_tree().fetch_branch_from(first, second)?;
            Ok((
                wrap_branch(left, BlockStateHandle::InstantFinality),
                wrap_branch(right, BlockStateHandle::InstantFinality),
            ))
        }
    }

    /// The raw blocks of the branch from the current head down toward the root, highest first.
    pub fn fetch_branch_from_head(&self) -> Vec<Arc<Block>> {
        fn blocks_of<V: BlockState>(tree: &ForkTree<V>) -> Vec<Arc<Block>> {
            match tree.head() {
                Some(head) => tree
                    .fetch_branch(head.id(), BlockNum::MAX)
                    .iter()
                    .filter_map(|n| n.block().cloned())
                    .collect(),
                None => Vec::new(),
            }
        }
        if self.is_legacy() {
            blocks_of(&self.fork_db_legacy)
        } else {
            blocks_of(self.if_tree())
        }
    }
}

fn wrap_branch<V: BlockState>(
    branch: Branch<V>,
    wrap: fn(Arc<V>) -> BlockStateHandle,
) -> Vec<BlockStateHandle> {
    branch.into_iter().map(wrap).collect()
}

fn peek_magic(fork_db_file: &Path) -> Result<u32, ForkDbError> {
    let mut magic_bytes = [0u8; 4];
    File::open(fork_db_file)?.read_exact(&mut magic_bytes)?;
    Ok(u32::from_le_bytes(magic_bytes))
}
