/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Add;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

/// 32-byte content hash that uniquely identifies a block.
///
/// Ids are compared by lexicographic ordering of their bytes. Within this crate, ids are always
/// SHA256 hashes over a block's header bytes (see
/// [`Block::compute_id`](super::block::Block::compute_id)).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Create a new `BlockId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `BlockId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// The lexicographically smallest `BlockId`.
    pub const MIN: BlockId = BlockId([0u8; 32]);

    /// Get the first seven characters of the Base64 encoding of this `BlockId`, for log lines.
    pub fn short(&self) -> String {
        let mut encoded = STANDARD_NO_PAD.encode(self.0);
        encoded.truncate(7);
        encoded
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Height of a block in the fork tree. Strictly `parent.block_num + 1` for linked children.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockNum(u32);

impl BlockNum {
    /// Create a new `BlockNum` with an `int` inner value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` value of this `BlockNum`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// The largest representable `BlockNum`.
    ///
    /// Doubles as the irreversibility sentinel of instant-finality block states (see
    /// [`IfBlockState`](super::block_state::IfBlockState)): a block whose irreversibility number
    /// is `MAX` is preferred over any block with a DPoS irreversibility number.
    pub const MAX: BlockNum = BlockNum(u32::MAX);
}

impl Display for BlockNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for BlockNum {
    type Output = BlockNum;
    fn add(self, rhs: u32) -> Self::Output {
        BlockNum(self.0 + rhs)
    }
}

/// Block timestamp: seconds since the Unix Epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new `Timestamp` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Timestamp`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte digest identifying a protocol feature.
///
/// Blocks declare newly activated features in their
/// [protocol feature activation extension](super::block::ProtocolFeatureActivation); the set of
/// features activated up to a block is carried in its header state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct FeatureDigest([u8; 32]);

impl FeatureDigest {
    /// Create a new `FeatureDigest` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `FeatureDigest`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for FeatureDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut encoded = STANDARD_NO_PAD.encode(self.0);
        encoded.truncate(7);
        f.write_str(&encoded)
    }
}
