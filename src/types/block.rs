/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'block' type, its header, and header extensions.
//!
//! The fork database does not define what a block *means*: execution, production and networking
//! are external collaborators. The types here carry exactly what the fork database consumes: a
//! parent link, a height, a timestamp, a list of header extensions, and an opaque payload that is
//! retained so that [`fetch_branch_from_head`](crate::database::ForkDatabase::fetch_branch_from_head)
//! can serve full blocks.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
pub use sha2::Sha256 as CryptoHasher;
use sha2::Digest;

use crate::types::basic::{BlockId, BlockNum, FeatureDigest, Timestamp};

/// Numeric tag of a header extension.
pub type ExtensionId = u16;

/// Header extensions of a block, keyed by extension id.
///
/// Built by [`Block::validate_and_extract_header_extensions`]; values are the raw extension
/// payloads, to be parsed by whoever recognizes the id.
pub type ExtensionMap = BTreeMap<ExtensionId, Vec<u8>>;

/// Extension id under which a block declares newly activated protocol features.
pub const PROTOCOL_FEATURE_ACTIVATION_EXT: ExtensionId = 0;

/// Extension id under which an instant-finality block carries its finality data.
pub const FINALITY_EXT: ExtensionId = 2;

/// Header of a [`Block`].
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockHeader {
    pub timestamp: Timestamp,
    pub previous: BlockId,
    pub block_num: BlockNum,
    /// Pairs of (extension id, raw extension payload). Must be sorted by strictly ascending id.
    pub header_extensions: Vec<(ExtensionId, Vec<u8>)>,
}

/// A block as the fork database stores it: a header plus an opaque payload.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader, payload: Vec<u8>) -> Block {
        Block { header, payload }
    }

    /// Compute the content hash that identifies the block carrying `header`.
    pub fn compute_id(header: &BlockHeader) -> BlockId {
        let mut hasher = CryptoHasher::new();
        hasher.update(header.try_to_vec().unwrap());
        BlockId::new(hasher.finalize().into())
    }

    /// Check the header extensions for well-formedness and return them as a map.
    ///
    /// Extension ids must appear in strictly ascending order (which also enforces uniqueness),
    /// and every id must be recognized by this build.
    pub fn validate_and_extract_header_extensions(&self) -> Result<ExtensionMap, ExtensionError> {
        let mut exts = ExtensionMap::new();
        let mut last_id: Option<ExtensionId> = None;
        for (id, data) in &self.header.header_extensions {
            if last_id.is_some_and(|last| *id <= last) {
                return Err(ExtensionError::UnorderedExtension { id: *id });
            }
            if *id != PROTOCOL_FEATURE_ACTIVATION_EXT && *id != FINALITY_EXT {
                return Err(ExtensionError::UnrecognizedExtension { id: *id });
            }
            exts.insert(*id, data.clone());
            last_id = Some(*id);
        }
        Ok(exts)
    }
}

/// Contents of the [`PROTOCOL_FEATURE_ACTIVATION_EXT`] header extension: the protocol features
/// a block declares as newly activated.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ProtocolFeatureActivation {
    pub protocol_features: Vec<FeatureDigest>,
}

impl ProtocolFeatureActivation {
    /// Parse an activation out of the raw payload of its header extension.
    pub fn parse(data: &[u8]) -> std::io::Result<ProtocolFeatureActivation> {
        ProtocolFeatureActivation::try_from_slice(data)
    }
}

/// Ways in which a block's header extension list can be malformed.
#[derive(Debug)]
pub enum ExtensionError {
    UnorderedExtension { id: ExtensionId },
    UnrecognizedExtension { id: ExtensionId },
}
