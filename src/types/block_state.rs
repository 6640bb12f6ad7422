/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block-state record kept per fork-tree node, in its two concrete variants.
//!
//! A fork tree is generic over [`BlockState`]: the capability set every node must provide so the
//! tree can link it to its parent, order it under the fork-choice rule, flip its validity, and
//! persist it. Two variants exist:
//!
//! - [`LegacyBlockState`]: blocks produced under delegated-proof-of-stake consensus. Their
//!   irreversibility number is the DPoS-irreversible block number computed at that block.
//! - [`IfBlockState`]: blocks produced under instant finality. Their irreversibility number is
//!   pinned to [`BlockNum::MAX`], so any instant-finality block outranks any legacy block that
//!   happens to coexist with it.
//!
//! Exactly one variant is active at a time; [`ForkDatabase`](crate::database::ForkDatabase) owns
//! the selection and the one-way switch.
//!
//! ## Shared ownership and mutability
//!
//! Nodes are handed out as `Arc` handles that the index, the current `root`/`head`, and any
//! branch returned to a caller may hold concurrently, with lifetimes independent of the tree.
//! The only mutable field is the validity flag, an atomic, because a pruned or rooted node must
//! never be structurally mutated while readers hold it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{BlockId, BlockNum, FeatureDigest, Timestamp};
use crate::types::block::{Block, ExtensionError, ExtensionMap};
use crate::types::crypto_primitives::BlsSignature;

/// The capability set a fork tree requires of its nodes.
pub trait BlockState: BorshSerialize + BorshDeserialize + Send + Sync + Sized + 'static {
    /// The header-state record of this variant: what a root retains after its body is discarded,
    /// and what the persistence format stores for the root.
    type HeaderState: Clone + BorshSerialize + BorshDeserialize + Send + Sync;

    /// Magic number identifying this variant's fork database file.
    const MAGIC: u32;

    /// Build a body-less block state out of a header state. Used for roots, which only need
    /// their header-state portion.
    fn from_header_state(header_state: Self::HeaderState) -> Self;

    fn header_state(&self) -> &Self::HeaderState;

    fn id(&self) -> BlockId;

    fn previous(&self) -> BlockId;

    fn block_num(&self) -> BlockNum;

    /// The irreversibility number this node carries into the fork-choice order.
    fn irreversibility_num(&self) -> BlockNum;

    fn timestamp(&self) -> Timestamp;

    fn is_valid(&self) -> bool;

    fn set_valid(&self, valid: bool);

    /// Digests of every protocol feature activated up to and including this block.
    fn activated_features(&self) -> &[FeatureDigest];

    /// Header extensions, as extracted from the block. Empty for roots built from a header
    /// state alone.
    fn header_exts(&self) -> &ExtensionMap;

    /// Re-extract the header extensions from the raw block. Called after deserialization, which
    /// does not store them.
    fn rebuild_header_exts(&mut self) -> Result<(), ExtensionError>;

    /// The block body, if retained. Roots constructed from a header state have none.
    fn block(&self) -> Option<&Arc<Block>>;
}

/// Header-state portion of a [`LegacyBlockState`].
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct LegacyBlockHeaderState {
    pub id: BlockId,
    pub header: super::block::BlockHeader,
    /// The DPoS-irreversible block number computed at this block. Monotone along a branch.
    pub dpos_irreversible_blocknum: BlockNum,
    pub activated_protocol_features: Vec<FeatureDigest>,
}

/// Block state of the delegated-proof-of-stake regime.
pub struct LegacyBlockState {
    header_state: LegacyBlockHeaderState,
    block: Option<Arc<Block>>,
    valid: AtomicBool,
    header_exts: ExtensionMap,
}

impl LegacyBlockState {
    /// Assemble a block state around `block`. Fails if the block's header extensions are
    /// malformed.
    pub fn new(
        header_state: LegacyBlockHeaderState,
        block: Block,
        valid: bool,
    ) -> Result<LegacyBlockState, ExtensionError> {
        let header_exts = block.validate_and_extract_header_extensions()?;
        Ok(LegacyBlockState {
            header_state,
            block: Some(Arc::new(block)),
            valid: AtomicBool::new(valid),
            header_exts,
        })
    }
}

impl BlockState for LegacyBlockState {
    type HeaderState = LegacyBlockHeaderState;

    const MAGIC: u32 = 0x30510FDB;

    fn from_header_state(header_state: LegacyBlockHeaderState) -> LegacyBlockState {
        LegacyBlockState {
            header_state,
            block: None,
            valid: AtomicBool::new(false),
            header_exts: ExtensionMap::new(),
        }
    }

    fn header_state(&self) -> &LegacyBlockHeaderState {
        &self.header_state
    }

    fn id(&self) -> BlockId {
        self.header_state.id
    }

    fn previous(&self) -> BlockId {
        self.header_state.header.previous
    }

    fn block_num(&self) -> BlockNum {
        self.header_state.header.block_num
    }

    fn irreversibility_num(&self) -> BlockNum {
        self.header_state.dpos_irreversible_blocknum
    }

    fn timestamp(&self) -> Timestamp {
        self.header_state.header.timestamp
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed)
    }

    fn activated_features(&self) -> &[FeatureDigest] {
        &self.header_state.activated_protocol_features
    }

    fn header_exts(&self) -> &ExtensionMap {
        &self.header_exts
    }

    fn rebuild_header_exts(&mut self) -> Result<(), ExtensionError> {
        if let Some(block) = &self.block {
            self.header_exts = block.validate_and_extract_header_extensions()?;
        }
        Ok(())
    }

    fn block(&self) -> Option<&Arc<Block>> {
        self.block.as_ref()
    }
}

impl BorshSerialize for LegacyBlockState {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header_state.serialize(writer)?;
        self.block.as_deref().serialize(writer)?;
        self.is_valid().serialize(writer)
    }
}

impl BorshDeserialize for LegacyBlockState {
    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<LegacyBlockState> {
        let header_state = LegacyBlockHeaderState::deserialize_reader(reader)?;
        let block = Option::<Block>::deserialize_reader(reader)?.map(Arc::new);
        let valid = bool::deserialize_reader(reader)?;
        Ok(LegacyBlockState {
            header_state,
            block,
            valid: AtomicBool::new(valid),
            // Not stored; rebuilt from the raw block by `rebuild_header_exts`.
            header_exts: ExtensionMap::new(),
        })
    }
}

/// Header-state portion of an [`IfBlockState`].
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct IfBlockHeaderState {
    pub id: BlockId,
    pub header: super::block::BlockHeader,
    pub activated_protocol_features: Vec<FeatureDigest>,
}

/// Block state of the instant-finality regime.
///
/// Finality is signaled per block through BLS aggregate signatures rather than through a DPoS
/// irreversibility number; the irreversibility number reported to the fork-choice order is the
/// [`BlockNum::MAX`] sentinel.
pub struct IfBlockState {
    header_state: IfBlockHeaderState,
    /// Aggregate finalizer signature over this block, once enough finalizers have signed.
    /// `None` on a block converted from the legacy regime during the switch.
    finality_signature: Option<BlsSignature>,
    block: Option<Arc<Block>>,
    valid: AtomicBool,
    header_exts: ExtensionMap,
}

impl IfBlockState {
    /// Assemble a block state around `block`. Fails if the block's header extensions are
    /// malformed.
    pub fn new(
        header_state: IfBlockHeaderState,
        finality_signature: Option<BlsSignature>,
        block: Block,
        valid: bool,
    ) -> Result<IfBlockState, ExtensionError> {
        let header_exts = block.validate_and_extract_header_extensions()?;
        Ok(IfBlockState {
            header_state,
            finality_signature,
            block: Some(Arc::new(block)),
            valid: AtomicBool::new(valid),
            header_exts,
        })
    }

    /// Reinterpret a legacy block state as the first block state of the instant-finality
    /// regime. Carries over identity, header, body and validity; there is no finalizer
    /// signature yet.
    pub fn from_legacy(legacy: &LegacyBlockState) -> IfBlockState {
        let legacy_hs = legacy.header_state();
        IfBlockState {
            header_state: IfBlockHeaderState {
                id: legacy_hs.id,
                header: legacy_hs.header.clone(),
                activated_protocol_features: legacy_hs.activated_protocol_features.clone(),
            },
            finality_signature: None,
            block: legacy.block().cloned(),
            valid: AtomicBool::new(legacy.is_valid()),
            header_exts: legacy.header_exts().clone(),
        }
    }

    pub fn finality_signature(&self) -> Option<&BlsSignature> {
        self.finality_signature.as_ref()
    }
}

impl BlockState for IfBlockState {
    type HeaderState = IfBlockHeaderState;

    const MAGIC: u32 = 0x4242FDB3;

    fn from_header_state(header_state: IfBlockHeaderState) -> IfBlockState {
        IfBlockState {
            header_state,
            finality_signature: None,
            block: None,
            valid: AtomicBool::new(false),
            header_exts: ExtensionMap::new(),
        }
    }

    fn header_state(&self) -> &IfBlockHeaderState {
        &self.header_state
    }

    fn id(&self) -> BlockId {
        self.header_state.id
    }

    fn previous(&self) -> BlockId {
        self.header_state.header.previous
    }

    fn block_num(&self) -> BlockNum {
        self.header_state.header.block_num
    }

    fn irreversibility_num(&self) -> BlockNum {
        BlockNum::MAX
    }

    fn timestamp(&self) -> Timestamp {
        self.header_state.header.timestamp
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed)
    }

    fn activated_features(&self) -> &[FeatureDigest] {
        &self.header_state.activated_protocol_features
    }

    fn header_exts(&self) -> &ExtensionMap {
        &self.header_exts
    }

    fn rebuild_header_exts(&mut self) -> Result<(), ExtensionError> {
        if let Some(block) = &self.block {
            self.header_exts = block.validate_and_extract_header_extensions()?;
        }
        Ok(())
    }

    fn block(&self) -> Option<&Arc<Block>> {
        self.block.as_ref()
    }
}

impl BorshSerialize for IfBlockState {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header_state.serialize(writer)?;
        self.finality_signature.serialize(writer)?;
        self.block.as_deref().serialize(writer)?;
        self.is_valid().serialize(writer)
    }
}

impl BorshDeserialize for IfBlockState {
    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<IfBlockState> {
        let header_state = IfBlockHeaderState::deserialize_reader(reader)?;
        let finality_signature = Option::<BlsSignature>::deserialize_reader(reader)?;
        let block = Option::<Block>::deserialize_reader(reader)?.map(Arc::new);
        let valid = bool::deserialize_reader(reader)?;
        Ok(IfBlockState {
            header_state,
            finality_signature,
            block,
            valid: AtomicBool::new(valid),
            header_exts: ExtensionMap::new(),
        })
    }
}
