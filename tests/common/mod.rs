/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Builders for the little chains the integration tests grow.

use std::sync::Arc;

use fork_db::types::basic::{BlockId, BlockNum, Timestamp};
use fork_db::types::block::{Block, BlockHeader};
use fork_db::types::block_state::{
    IfBlockHeaderState, IfBlockState, LegacyBlockHeaderState, LegacyBlockState,
};
use fork_db::types::crypto_primitives::BlsSignature;

fn header(previous: BlockId, block_num: u32, salt: u64) -> BlockHeader {
    BlockHeader {
        timestamp: Timestamp::new(salt),
        previous,
        block_num: BlockNum::new(block_num),
        header_extensions: vec![],
    }
}

/// Header state of a legacy root at height `block_num`.
pub fn legacy_root(block_num: u32, irr: u32) -> LegacyBlockHeaderState {
    let header = header(BlockId::MIN, block_num, 0);
    LegacyBlockHeaderState {
        id: Block::compute_id(&header),
        header,
        dpos_irreversible_blocknum: BlockNum::new(irr),
        activated_protocol_features: vec![],
    }
}

/// A legacy block state extending `previous`. `salt` differentiates siblings.
pub fn legacy_child(
    previous: BlockId,
    block_num: u32,
    irr: u32,
    salt: u64,
    valid: bool,
) -> Arc<LegacyBlockState> {
    let header = header(previous, block_num, salt);
    let header_state = LegacyBlockHeaderState {
        id: Block::compute_id(&header),
        header: header.clone(),
        dpos_irreversible_blocknum: BlockNum::new(irr),
        activated_protocol_features: vec![],
    };
    let payload = salt.to_le_bytes().to_vec();
    Arc::new(LegacyBlockState::new(header_state, Block::new(header, payload), valid).unwrap())
}

/// An instant-finality block state extending `previous`, carrying an aggregate finalizer
/// signature.
pub fn if_child(previous: BlockId, block_num: u32, salt: u64, valid: bool) -> Arc<IfBlockState> {
    let header = header(previous, block_num, salt);
    let header_state = IfBlockHeaderState {
        id: Block::compute_id(&header),
        header: header.clone(),
        activated_protocol_features: vec![],
    };
    let signature = BlsSignature::new([salt as u8; 96]);
    let payload = salt.to_le_bytes().to_vec();
    Arc::new(
        IfBlockState::new(header_state, Some(signature), Block::new(header, payload), valid)
            .unwrap(),
    )
}
