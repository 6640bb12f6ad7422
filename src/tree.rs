/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fork tree: a concurrency-safe tree of block states past the last finalized block.
//!
//! A [`ForkTree`] owns a distinguished `root` (the last finalized block, always valid), a
//! [multi-indexed container](crate::index) of every candidate descendant, and a `head`: the most
//! preferred valid tip under the [fork-choice order](crate::index::first_preferred).
//!
//! Every public operation acquires the tree's one mutex for the whole call, so operations on a
//! single tree are totally ordered. Validators invoked by a validated add run under the lock and
//! must not re-enter the fork database.
//!
//! Nodes handed out by the tree are [`Arc`] handles whose lifetimes are independent of the tree:
//! a caller may keep a branch alive after the containing subtree has been pruned. Pruned nodes
//! and nodes promoted to `root` are therefore never mutated.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::index::{first_preferred, ForkIndex};
use crate::types::basic::{BlockId, BlockNum, FeatureDigest, Timestamp};
use crate::types::block::{ExtensionError, ProtocolFeatureActivation, PROTOCOL_FEATURE_ACTIVATION_EXT};
use crate::types::block_state::BlockState;

/// Callback invoked during a validated add when a block declares newly activated protocol
/// features. Receives the block's timestamp, the features activated at its parent, and the
/// newly declared features. A rejection aborts the add.
pub type Validator<'a> =
    dyn FnMut(Timestamp, &[FeatureDigest], &[FeatureDigest]) -> Result<(), String> + 'a;

/// A branch: nodes ordered from highest block number down toward (and excluding) the root.
pub type Branch<V> = Vec<Arc<V>>;

/// Everything that can go wrong inside the fork database.
#[derive(Debug)]
pub enum ForkDbError {
    /// An operation that requires an initialized root was called before `reset`.
    RootNotSet,
    /// `add` found no parent for the node.
    Unlinkable { id: BlockId, previous: BlockId },
    /// `add` found an existing node with the same id and `ignore_duplicate` was false.
    Duplicate { id: BlockId },
    /// A lookup required a node that is absent.
    NotFound { id: BlockId },
    /// `advance_root` targeted a node that has not been validated.
    NotValidated { id: BlockId },
    /// `remove` would remove the current head's subtree.
    WouldRemoveHead { id: BlockId },
    /// A fork database file began with an unexpected magic number.
    BadMagic { actual: u32 },
    /// A fork database file was written by an unsupported format version.
    UnsupportedVersion { version: u32, min: u32, max: u32 },
    /// A fork database file contradicts itself. The tree is left as reconstructed up to the
    /// failure point.
    Corrupt { reason: &'static str },
    /// The external feature validator signaled incompatibility.
    ValidatorRejected { reason: String },
    /// A block's header extensions are malformed.
    Extension(ExtensionError),
    /// A facade operation was handed a block state of the inactive variant.
    VariantMismatch,
    /// `switch_from_legacy` was requested but no legacy chain head has been assigned.
    ChainHeadNotSet,
    Io(io::Error),
}

impl From<ExtensionError> for ForkDbError {
    fn from(value: ExtensionError) -> Self {
        ForkDbError::Extension(value)
    }
}

impl From<io::Error> for ForkDbError {
    fn from(value: io::Error) -> Self {
        ForkDbError::Io(value)
    }
}

pub(crate) struct TreeState<V: BlockState> {
    pub(crate) index: ForkIndex<V>,
    pub(crate) root: Option<Arc<V>>,
    pub(crate) head: Option<Arc<V>>,
    pub(crate) chain_head: Option<Arc<V>>,
}

/// An in-memory, mutex-guarded fork tree over one block-state variant.
pub struct ForkTree<V: BlockState> {
    state: Mutex<TreeState<V>>,
}

impl<V: BlockState> ForkTree<V> {
    /// Create an empty tree. No operation that requires a root will succeed until
    /// [`reset`](Self::reset) (or a successful [`open`](Self::open)) has run.
    pub fn new() -> ForkTree<V> {
        ForkTree {
            state: Mutex::new(TreeState {
                index: ForkIndex::new(),
                root: None,
                head: None,
                chain_head: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TreeState<V>> {
        self.state.lock().unwrap()
    }

    /// Discard all state and install a new root built from `root_header_state`. The root is
    /// marked valid and becomes the head.
    pub fn reset(&self, root_header_state: V::HeaderState) {
        let mut state = self.lock();
        Self::reset_impl(&mut state, root_header_state);
    }

    pub(crate) fn reset_impl(state: &mut TreeState<V>, root_header_state: V::HeaderState) {
        state.index.clear();
        let root = Arc::new(V::from_header_state(root_header_state));
        root.set_valid(true);
        state.root = Some(root.clone());
        state.head = Some(root);
    }

    /// Link `n` under its parent and admit it as a head candidate.
    ///
    /// The head moves iff the best entry of the preference index is valid after insertion; a
    /// node added with `valid == false` can only move the head later, through
    /// [`mark_valid`](Self::mark_valid).
    pub fn add(&self, n: Arc<V>, ignore_duplicate: bool) -> Result<(), ForkDbError> {
        let mut state = self.lock();
        Self::add_impl(&mut state, n, ignore_duplicate, false, &mut |_, _, _| Ok(()))
    }

    pub(crate) fn add_impl(
        state: &mut TreeState<V>,
        n: Arc<V>,
        ignore_duplicate: bool,
        validate: bool,
        validator: &mut Validator,
    ) -> Result<(), ForkDbError> {
        if state.root.is_none() {
            return Err(ForkDbError::RootNotSet);
        }

        let prev = Self::get_block_header_impl(state, &n.previous()).ok_or(
            ForkDbError::Unlinkable {
                id: n.id(),
                previous: n.previous(),
            },
        )?;

        if validate {
            if let Some(raw) = n.header_exts().get(&PROTOCOL_FEATURE_ACTIVATION_EXT) {
                let activation = ProtocolFeatureActivation::parse(raw).map_err(|_| {
                    ForkDbError::Corrupt {
                        reason: "stored block carries a malformed protocol feature activation",
                    }
                })?;
                validator(
                    n.timestamp(),
                    prev.activated_features(),
                    &activation.protocol_features,
                )
                .map_err(|reason| ForkDbError::ValidatorRejected { reason })?;
            }
        }

        if !state.index.insert(n.clone()) {
            if ignore_duplicate {
                return Ok(());
            }
            return Err(ForkDbError::Duplicate { id: n.id() });
        }

        // The best entry is valid-first, so if it is valid it is at least as preferred as any
        // valid node, the current head included.
        if let Some(candidate) = state.index.best() {
            if candidate.is_valid() {
                state.head = Some(candidate.clone());
            }
        }
        Ok(())
    }

    /// Flip `h` to valid and move the head if `h`'s branch is now the most preferred valid one.
    pub fn mark_valid(&self, h: &Arc<V>) -> Result<(), ForkDbError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if h.is_valid() {
            return Ok(());
        }
        let id = h.id();
        if !state.index.set_valid(&id, true) {
            return Err(ForkDbError::NotFound { id });
        }
        if let (Some(candidate), Some(head)) = (state.index.best(), &state.head) {
            if first_preferred(candidate.as_ref(), head.as_ref()) {
                state.head = Some(candidate.clone());
            }
        }
        Ok(())
    }

    /// Set every node in the index invalid and pull the head back to the root. Used when a soft
    /// error requires re-validating all descendants.
    pub fn rollback_head_to_root(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.index.invalidate_all();
        state.head = state.root.clone();
    }

    /// Make the valid node `id` the new root, pruning every branch that does not descend from
    /// it. The new root node itself is not mutated: readers may still hold references to it.
    pub fn advance_root(&self, id: BlockId) -> Result<(), ForkDbError> {
        let mut state = self.lock();

        let root = state.root.clone().ok_or(ForkDbError::RootNotSet)?;
        let new_root = state
            .index
            .get(&id)
            .cloned()
            .ok_or(ForkDbError::NotFound { id })?;
        if !new_root.is_valid() {
            return Err(ForkDbError::NotValidated { id });
        }

        // Ancestors of the new root, ending at the old root. Removing their subtrees removes
        // every branch not descending from the new root.
        let mut blocks_to_remove: Vec<BlockId> = Vec::new();
        let mut b = new_root.clone();
        loop {
            let prev = b.previous();
            blocks_to_remove.push(prev);
            match state.index.get(&prev) {
                Some(parent) => b = parent.clone(),
                None => {
                    if prev != root.id() {
                        return Err(ForkDbError::Corrupt {
                            reason: "orphaned branch was present in fork database",
                        });
                    }
                    break;
                }
            }
        }

        // The new root is erased individually rather than with `remove`: its children stay.
        state.index.erase(&id);
        for block_id in &blocks_to_remove {
            Self::remove_impl(&mut state, *block_id)?;
        }

        crate::logging::log_advance_root(&id, new_root.block_num());
        state.root = Some(new_root);
        Ok(())
    }

    /// Remove the node `id` and all of its descendants.
    ///
    /// Fails before any mutation if the current head is anywhere in the doomed subtree.
    pub fn remove(&self, id: BlockId) -> Result<(), ForkDbError> {
        let mut state = self.lock();
        Self::remove_impl(&mut state, id)
    }

    fn remove_impl(state: &mut TreeState<V>, id: BlockId) -> Result<(), ForkDbError> {
        let mut remove_queue = VecDeque::from([id]);
        let head_id = state.head.as_ref().map(|head| head.id());

        let mut i = 0;
        while i < remove_queue.len() {
            if Some(remove_queue[i]) == head_id {
                return Err(ForkDbError::WouldRemoveHead {
                    id: remove_queue[i],
                });
            }
            let children: Vec<BlockId> =
                state.index.children(&remove_queue[i]).copied().collect();
            remove_queue.extend(children);
            i += 1;
        }

        for block_id in &remove_queue {
            state.index.erase(block_id);
        }
        Ok(())
    }

    /// The node with this id, out of the index. The root is not part of the index and resolves
    /// to `None` here; use [`get_block_header`](Self::get_block_header) to include it.
    pub fn get_block(&self, id: &BlockId) -> Option<Arc<V>> {
        let state = self.lock();
        state.index.get(id).cloned()
    }

    /// The node with this id, out of {root} ∪ index.
    pub fn get_block_header(&self, id: &BlockId) -> Option<Arc<V>> {
        let state = self.lock();
        Self::get_block_header_impl(&state, id)
    }

    fn get_block_header_impl(state: &TreeState<V>, id: &BlockId) -> Option<Arc<V>> {
        match &state.root {
            Some(root) if root.id() == *id => Some(root.clone()),
            _ => state.index.get(id).cloned(),
        }
    }

    pub fn root(&self) -> Option<Arc<V>> {
        self.lock().root.clone()
    }

    /// The most preferred valid tip.
    pub fn head(&self) -> Option<Arc<V>> {
        self.lock().head.clone()
    }

    /// The most preferred tip, valid or not: the best unvalidated entry if it out-prefers the
    /// head, else the head.
    pub fn pending_head(&self) -> Option<Arc<V>> {
        let state = self.lock();
        if let (Some(candidate), Some(head)) = (state.index.best_unvalidated(), &state.head) {
            if !candidate.is_valid() && first_preferred(candidate.as_ref(), head.as_ref()) {
                return Some(candidate.clone());
            }
        }
        state.head.clone()
    }

    /// The chain head last assigned by the driver of this tree. Distinct from
    /// [`head`](Self::head): this is whatever block the chain controller currently builds on.
    pub fn chain_head(&self) -> Option<Arc<V>> {
        self.lock().chain_head.clone()
    }

    pub fn set_chain_head(&self, chain_head: Option<Arc<V>>) {
        self.lock().chain_head = chain_head;
    }

    /// Walk from `h` toward the root, collecting every node with
    /// `block_num <= trim_after_block_num`. The walk stops where the parent lookup falls off
    /// the index, so the root itself is never included. Ordered highest block number first.
    pub fn fetch_branch(&self, h: BlockId, trim_after_block_num: BlockNum) -> Branch<V> {
        let state = self.lock();
        let mut result = Vec::new();
        let mut s = state.index.get(&h).cloned();
        while let Some(node) = s {
            if node.block_num() <= trim_after_block_num {
                result.push(node.clone());
            }
            s = state.index.get(&node.previous()).cloned();
        }
        result
    }

    /// Walk from `h` toward the root and return the first node with this exact block number.
    pub fn search_on_branch(&self, h: BlockId, block_num: BlockNum) -> Option<Arc<V>> {
        let state = self.lock();
        let mut s = state.index.get(&h).cloned();
        while let Some(node) = s {
            if node.block_num() == block_num {
                return Some(node);
            }
            s = state.index.get(&node.previous()).cloned();
        }
        None
    }

    /// Given two tips of this tree, return the minimal suffix of each branch up to (and not
    /// including) their lowest common ancestor. `(empty, empty)` if the tips are equal.
    pub fn fetch_branch_from(
        &self,
        first: BlockId,
        second: BlockId,
    ) -> Result<(Branch<V>, Branch<V>), ForkDbError> {
        let state = self.lock();
        let root = state.root.as_ref().ok_or(ForkDbError::RootNotSet)?;
        let resolve = |id: &BlockId| -> Option<Arc<V>> {
            if *id == root.id() {
                Some(root.clone())
            } else {
                state.index.get(id).cloned()
            }
        };

        let mut result = (Vec::new(), Vec::new());
        let mut first_branch = resolve(&first).ok_or(ForkDbError::NotFound { id: first })?;
        let mut second_branch = resolve(&second).ok_or(ForkDbError::NotFound { id: second })?;

        while first_branch.block_num() > second_branch.block_num() {
            result.0.push(first_branch.clone());
            let prev = first_branch.previous();
            first_branch = resolve(&prev).ok_or(ForkDbError::NotFound { id: prev })?;
        }

        while second_branch.block_num() > first_branch.block_num() {
            result.1.push(second_branch.clone());
            let prev = second_branch.previous();
            second_branch = resolve(&prev).ok_or(ForkDbError::NotFound { id: prev })?;
        }

        if first_branch.id() == second_branch.id() {
            return Ok(result);
        }

        while first_branch.previous() != second_branch.previous() {
            result.0.push(first_branch.clone());
            result.1.push(second_branch.clone());
            let first_prev = first_branch.previous();
            let second_prev = second_branch.previous();
            first_branch = state
                .index
                .get(&first_prev)
                .cloned()
                .ok_or(ForkDbError::NotFound { id: first_prev })?;
            second_branch = state
                .index
                .get(&second_prev)
                .cloned()
                .ok_or(ForkDbError::NotFound { id: second_prev })?;
        }

        // The two siblings that share the common parent.
        result.0.push(first_branch);
        result.1.push(second_branch);
        Ok(result)
    }
}

impl<V: BlockState> Default for ForkTree<V> {
    fn default() -> Self {
        Self::new()
    }
}
