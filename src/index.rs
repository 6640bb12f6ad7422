/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The multi-indexed node container backing a fork tree.
//!
//! Three indexes over one set of shared nodes:
//! 1. **by id**: unique hash lookup.
//! 2. **by previous**: parent id -> child ids, for subtree traversal.
//! 3. **by fork preference**: the composite order `(valid desc, irreversibility_num desc,
//!    block_num desc, id asc)`. The first entry overall is the best *pending* candidate; the
//!    first entry of the valid range is the best head candidate.
//!
//! All three are kept in sync on every insert, erase and validity change. Validity is the only
//! mutable component of the composite key, so [`ForkIndex::set_valid`] re-keys the preference
//! index in place.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::types::basic::{BlockId, BlockNum};
use crate::types::block_state::BlockState;

/// The fork-choice order: `a` is preferred over `b` iff
/// `(a.irreversibility_num, a.block_num) > (b.irreversibility_num, b.block_num)`.
///
/// Validity deliberately does not participate: it is enforced separately by only admitting valid
/// nodes as head candidates. In the legacy regime this prefers the branch with the longer
/// known-final prefix, tiebroken by height; instant-finality blocks carry the
/// [`BlockNum::MAX`] sentinel and therefore dominate every legacy block.
pub fn first_preferred<V: BlockState>(a: &V, b: &V) -> bool {
    (a.irreversibility_num(), a.block_num()) > (b.irreversibility_num(), b.block_num())
}

/// Composite key of the fork-preference index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PreferenceKey {
    pub(crate) valid: bool,
    pub(crate) irreversibility_num: BlockNum,
    pub(crate) block_num: BlockNum,
    pub(crate) id: BlockId,
}

impl PreferenceKey {
    pub(crate) fn of<V: BlockState>(node: &V) -> PreferenceKey {
        PreferenceKey {
            valid: node.is_valid(),
            irreversibility_num: node.irreversibility_num(),
            block_num: node.block_num(),
            id: node.id(),
        }
    }

    /// [`first_preferred`], lifted onto keys.
    pub(crate) fn first_preferred_over(&self, other: &PreferenceKey) -> bool {
        (self.irreversibility_num, self.block_num) > (other.irreversibility_num, other.block_num)
    }

    /// The smallest key of the `valid == false` region: everything at or after it in the index
    /// is unvalidated.
    const fn unvalidated_region_start() -> PreferenceKey {
        PreferenceKey {
            valid: false,
            irreversibility_num: BlockNum::MAX,
            block_num: BlockNum::MAX,
            id: BlockId::MIN,
        }
    }
}

impl Ord for PreferenceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .valid
            .cmp(&self.valid)
            .then(other.irreversibility_num.cmp(&self.irreversibility_num))
            .then(other.block_num.cmp(&self.block_num))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for PreferenceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct ForkIndex<V: BlockState> {
    by_id: HashMap<BlockId, Arc<V>>,
    by_prev: BTreeMap<BlockId, BTreeSet<BlockId>>,
    by_lib_block_num: BTreeSet<PreferenceKey>,
}

impl<V: BlockState> ForkIndex<V> {
    pub(crate) fn new() -> ForkIndex<V> {
        ForkIndex {
            by_id: HashMap::new(),
            by_prev: BTreeMap::new(),
            by_lib_block_num: BTreeSet::new(),
        }
    }

    /// Insert `node` into all three indexes. Returns false (and leaves the container untouched)
    /// if a node with the same id is already present.
    pub(crate) fn insert(&mut self, node: Arc<V>) -> bool {
        let id = node.id();
        if self.by_id.contains_key(&id) {
            return false;
        }
        self.by_prev.entry(node.previous()).or_default().insert(id);
        self.by_lib_block_num.insert(PreferenceKey::of(node.as_ref()));
        self.by_id.insert(id, node);
        true
    }

    /// Erase the node with this id from all three indexes. Children are untouched.
    pub(crate) fn erase(&mut self, id: &BlockId) -> Option<Arc<V>> {
        let node = self.by_id.remove(id)?;
        if let Some(siblings) = self.by_prev.get_mut(&node.previous()) {
            siblings.remove(id);
            if siblings.is_empty() {
                self.by_prev.remove(&node.previous());
            }
        }
        self.by_lib_block_num.remove(&PreferenceKey::of(node.as_ref()));
        Some(node)
    }

    pub(crate) fn get(&self, id: &BlockId) -> Option<&Arc<V>> {
        self.by_id.get(id)
    }

    /// Ids of the immediate children of `id`.
    pub(crate) fn children(&self, id: &BlockId) -> impl Iterator<Item = &BlockId> + '_ {
        self.by_prev.get(id).into_iter().flatten()
    }

    /// Flip the validity flag of the node with this id, re-keying the preference index. Returns
    /// false if the id is absent.
    pub(crate) fn set_valid(&mut self, id: &BlockId, valid: bool) -> bool {
        let Some(node) = self.by_id.get(id) else {
            return false;
        };
        self.by_lib_block_num.remove(&PreferenceKey::of(node.as_ref()));
        node.set_valid(valid);
        self.by_lib_block_num.insert(PreferenceKey::of(node.as_ref()));
        true
    }

    /// Set every node's validity flag to false.
    pub(crate) fn invalidate_all(&mut self) {
        for node in self.by_id.values() {
            node.set_valid(false);
        }
        self.by_lib_block_num = self
            .by_id
            .values()
            .map(|node| PreferenceKey::of(node.as_ref()))
            .collect();
    }

    /// The most preferred entry overall, valid or not.
    pub(crate) fn best(&self) -> Option<&Arc<V>> {
        self.by_lib_block_num.first().map(|key| &self.by_id[&key.id])
    }

    /// The most preferred entry among those with `valid == false`.
    pub(crate) fn best_unvalidated(&self) -> Option<&Arc<V>> {
        self.by_lib_block_num
            .range(PreferenceKey::unvalidated_region_start()..)
            .next()
            .map(|key| &self.by_id[&key.id])
    }

    /// Keys of the `valid == true` region, most preferred first.
    pub(crate) fn validated_keys(
        &self,
    ) -> impl DoubleEndedIterator<Item = &PreferenceKey> + '_ {
        self.by_lib_block_num
            .range(..PreferenceKey::unvalidated_region_start())
    }

    /// Keys of the `valid == false` region, most preferred first.
    pub(crate) fn unvalidated_keys(
        &self,
    ) -> impl DoubleEndedIterator<Item = &PreferenceKey> + '_ {
        self.by_lib_block_num
            .range(PreferenceKey::unvalidated_region_start()..)
    }

    /// Look up the node a preference key refers to.
    ///
    /// # Panics
    ///
    /// Panics if `key` was not obtained from this container's preference index.
    pub(crate) fn resolve(&self, key: &PreferenceKey) -> &Arc<V> {
        &self.by_id[&key.id]
    }

    pub(crate) fn clear(&mut self) {
        self.by_id.clear();
        self.by_prev.clear();
        self.by_lib_block_num.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{FeatureDigest, Timestamp};
    use crate::types::block::{Block, BlockHeader};
    use crate::types::block_state::{LegacyBlockHeaderState, LegacyBlockState};

    fn id(n: u8) -> BlockId {
        BlockId::new([n; 32])
    }

    fn state(n: u8, prev: u8, num: u32, irr: u32, valid: bool) -> Arc<LegacyBlockState> {
        let header = BlockHeader {
            timestamp: Timestamp::new(num as u64),
            previous: id(prev),
            block_num: BlockNum::new(num),
            header_extensions: vec![],
        };
        let header_state = LegacyBlockHeaderState {
            id: id(n),
            header: header.clone(),
            dpos_irreversible_blocknum: BlockNum::new(irr),
            activated_protocol_features: Vec::<FeatureDigest>::new(),
        };
        Arc::new(LegacyBlockState::new(header_state, Block::new(header, vec![]), valid).unwrap())
    }

    #[test]
    fn preference_order_is_valid_irr_num_desc_then_id_asc() {
        let mut index = ForkIndex::new();
        assert!(index.insert(state(1, 0, 5, 2, false)));
        assert!(index.insert(state(2, 0, 9, 3, false)));
        assert!(index.insert(state(3, 0, 4, 1, true)));
        assert!(index.insert(state(4, 0, 9, 3, false))); // same (irr, num) as 2, larger id

        // A valid node ranks above every unvalidated node regardless of (irr, num).
        assert_eq!(index.best().unwrap().id(), id(3));
        // Among unvalidated nodes: higher irr wins, then higher num, then smaller id.
        assert_eq!(index.best_unvalidated().unwrap().id(), id(2));

        let validated: Vec<BlockId> = index.validated_keys().map(|k| k.id).collect();
        assert_eq!(validated, vec![id(3)]);
        let unvalidated: Vec<BlockId> = index.unvalidated_keys().map(|k| k.id).collect();
        assert_eq!(unvalidated, vec![id(2), id(4), id(1)]);
    }

    #[test]
    fn duplicate_insert_is_rejected_without_touching_indexes() {
        let mut index = ForkIndex::new();
        assert!(index.insert(state(1, 0, 1, 0, false)));
        assert!(!index.insert(state(1, 9, 7, 7, true)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&id(1)).unwrap().previous(), id(0));
        assert!(index.children(&id(9)).next().is_none());
    }

    #[test]
    fn set_valid_rekeys_the_preference_index() {
        let mut index = ForkIndex::new();
        index.insert(state(1, 0, 1, 0, true));
        index.insert(state(2, 1, 2, 0, false));

        assert_eq!(index.best().unwrap().id(), id(1));
        assert!(index.set_valid(&id(2), true));
        assert_eq!(index.best().unwrap().id(), id(2));
        assert!(index.best_unvalidated().is_none());
        assert!(!index.set_valid(&id(9), true));
    }

    #[test]
    fn erase_keeps_all_indexes_in_sync() {
        let mut index = ForkIndex::new();
        index.insert(state(1, 0, 1, 0, false));
        index.insert(state(2, 1, 2, 0, false));
        index.insert(state(3, 1, 2, 0, false));

        let erased = index.erase(&id(2)).unwrap();
        assert_eq!(erased.id(), id(2));
        assert!(index.erase(&id(2)).is_none());
        assert_eq!(index.len(), 2);
        let children: Vec<&BlockId> = index.children(&id(1)).collect();
        assert_eq!(children, vec![&id(3)]);
        assert_eq!(index.unvalidated_keys().count(), 2);
    }

    #[test]
    fn invalidate_all_demotes_every_node() {
        let mut index = ForkIndex::new();
        index.insert(state(1, 0, 1, 0, true));
        index.insert(state(2, 1, 2, 1, true));
        index.invalidate_all();
        assert!(index.validated_keys().next().is_none());
        assert_eq!(index.unvalidated_keys().count(), 2);
        assert_eq!(index.best_unvalidated().unwrap().id(), id(2));
    }
}
