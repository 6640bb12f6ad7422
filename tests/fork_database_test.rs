/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Integration tests for the fork database facade: persistence through the data directory,
//! dispatch between the two block-state variants, and the one-way legacy → instant-finality
//! switch.

mod common;

use common::{if_child, legacy_child, legacy_root};
use fork_db::types::basic::{BlockNum, FeatureDigest, Timestamp};
use fork_db::types::block_state::{BlockState, LegacyBlockState};
use fork_db::{BlockHeaderStateHandle, BlockStateHandle, ForkDatabase, ForkDbError, ForkTree};

fn no_op_validator(_: Timestamp, _: &[FeatureDigest], _: &[FeatureDigest]) -> Result<(), String> {
    Ok(())
}

#[test]
fn opens_legacy_and_empty_when_no_file_exists() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("blocks");

    let db = ForkDatabase::new(&data_dir);
    db.open(&mut no_op_validator).unwrap();

    assert!(db.is_legacy());
    assert!(db.head().is_none());
    assert!(db.root().is_none());
    // The data directory is created on open.
    assert!(data_dir.is_dir());
}

#[test]
fn legacy_state_round_trips_through_the_data_dir() {
    let dir = tempfile::tempdir().unwrap();

    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();

    let root_hs = legacy_root(5, 3);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();

    let a = legacy_child(root_id, 6, 3, 1, true);
    let b = legacy_child(a.id(), 7, 4, 2, false);
    db.add(BlockStateHandle::Legacy(a.clone()), false).unwrap();
    db.add(BlockStateHandle::Legacy(b.clone()), false).unwrap();
    db.mark_valid(&BlockStateHandle::Legacy(b.clone())).unwrap();
    assert_eq!(db.head().unwrap().id(), b.id());

    db.close().unwrap();
    let file = dir.path().join(fork_db::FORK_DB_FILENAME);
    assert!(file.exists());

    let reopened = ForkDatabase::new(dir.path());
    reopened.open(&mut no_op_validator).unwrap();
    assert!(reopened.is_legacy());
    assert!(!file.exists());
    assert_eq!(reopened.root().unwrap().id(), root_id);
    assert_eq!(reopened.head().unwrap().id(), b.id());
    assert_eq!(
        reopened.get_block(&a.id()).unwrap().block_num(),
        BlockNum::new(6)
    );

    // S1 on the reopened database: the head only moves once the new tip validates.
    let c = legacy_child(b.id(), 8, 4, 3, false);
    reopened.add(BlockStateHandle::Legacy(c.clone()), false).unwrap();
    assert_eq!(reopened.head().unwrap().id(), b.id());
    assert_eq!(reopened.pending_head().unwrap().id(), c.id());
    reopened.mark_valid(&BlockStateHandle::Legacy(c.clone())).unwrap();
    assert_eq!(reopened.head().unwrap().id(), c.id());
}

#[test]
fn switch_from_legacy_is_one_way_and_keeps_the_old_tree() {
    let dir = tempfile::tempdir().unwrap();
    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();

    // Before a chain head exists, there is nothing to switch from.
    assert!(matches!(
        db.switch_from_legacy(),
        Err(ForkDbError::ChainHeadNotSet)
    ));

    let root_hs = legacy_root(0, 0);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();
    let tip = legacy_child(root_id, 1, 0, 1, true);
    db.add(BlockStateHandle::Legacy(tip.clone()), false).unwrap();
    db.set_chain_head(BlockStateHandle::Legacy(tip.clone())).unwrap();

    db.switch_from_legacy().unwrap();
    assert!(!db.is_legacy());

    // The instant-finality tree is rooted at the converted legacy head.
    assert_eq!(db.root().unwrap().id(), tip.id());
    assert_eq!(db.chain_head().unwrap().id(), tip.id());

    // The retired legacy tree stays readable.
    let legacy = db.legacy_fork_db();
    assert_eq!(legacy.head().unwrap().id(), tip.id());
    assert_eq!(legacy.chain_head().unwrap().id(), tip.id());

    // Writes of the inactive variant are refused at the facade.
    let stale = legacy_child(tip.id(), 2, 0, 2, true);
    assert!(matches!(
        db.add(BlockStateHandle::Legacy(stale), false),
        Err(ForkDbError::VariantMismatch)
    ));

    // Instant-finality blocks flow normally, and report the irreversibility sentinel.
    let n2 = if_child(tip.id(), 2, 3, true);
    db.add(BlockStateHandle::InstantFinality(n2.clone()), false).unwrap();
    assert_eq!(db.head().unwrap().id(), n2.id());
    assert_eq!(db.head().unwrap().irreversibility_num(), BlockNum::MAX);
}

#[test]
fn open_dispatches_on_the_file_magic() {
    let dir = tempfile::tempdir().unwrap();

    // Grow a legacy database, switch it, extend the instant-finality side, close.
    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();
    let root_hs = legacy_root(0, 0);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();
    let tip = legacy_child(root_id, 1, 0, 1, true);
    db.add(BlockStateHandle::Legacy(tip.clone()), false).unwrap();
    db.set_chain_head(BlockStateHandle::Legacy(tip.clone())).unwrap();
    db.switch_from_legacy().unwrap();

    let n2 = if_child(tip.id(), 2, 2, true);
    let n3 = if_child(n2.id(), 3, 3, true);
    db.add(BlockStateHandle::InstantFinality(n2.clone()), false).unwrap();
    db.add(BlockStateHandle::InstantFinality(n3.clone()), false).unwrap();
    db.close().unwrap();

    // Reopening sees the instant-finality magic and comes up in instant-finality mode.
    let reopened = ForkDatabase::new(dir.path());
    reopened.open(&mut no_op_validator).unwrap();
    assert!(!reopened.is_legacy());
    assert_eq!(reopened.root().unwrap().id(), tip.id());
    assert_eq!(reopened.head().unwrap().id(), n3.id());
    let restored = reopened.if_fork_db().unwrap().get_block(&n2.id()).unwrap();
    assert_eq!(
        restored.finality_signature(),
        n2.finality_signature()
    );
}

#[test]
fn fetch_branch_from_head_serves_raw_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();

    let root_hs = legacy_root(0, 0);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();
    let a = legacy_child(root_id, 1, 0, 1, true);
    let b = legacy_child(a.id(), 2, 0, 2, true);
    db.add(BlockStateHandle::Legacy(a.clone()), false).unwrap();
    db.add(BlockStateHandle::Legacy(b.clone()), false).unwrap();

    let blocks = db.fetch_branch_from_head();
    let payloads: Vec<&[u8]> = blocks.iter().map(|block| block.payload.as_slice()).collect();
    assert_eq!(
        payloads,
        vec![2u64.to_le_bytes().as_slice(), 1u64.to_le_bytes().as_slice()]
    );
}

#[test]
fn facade_branch_queries_mirror_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();

    let root_hs = legacy_root(0, 0);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();
    let a = legacy_child(root_id, 1, 0, 1, true);
    let x = legacy_child(a.id(), 2, 0, 2, true);
    let y = legacy_child(a.id(), 2, 0, 3, true);
    for n in [&a, &x, &y] {
        db.add(BlockStateHandle::Legacy(n.clone()), false).unwrap();
    }

    let (left, right) = db.fetch_branch_from(x.id(), y.id()).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert_eq!(left[0].id(), x.id());
    assert_eq!(right[0].id(), y.id());

    assert_eq!(
        db.search_on_branch(x.id(), BlockNum::new(1)).unwrap().id(),
        a.id()
    );
    // The root is visible through get_block_header but not through get_block.
    assert!(db.get_block(&root_id).is_none());
    assert_eq!(db.get_block_header(&root_id).unwrap().id(), root_id);
}

#[test]
fn standalone_tree_open_rejects_a_foreign_file() {
    // A file written by the instant-finality variant must not load into a legacy tree.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(fork_db::FORK_DB_FILENAME);

    let db = ForkDatabase::new(dir.path());
    db.open(&mut no_op_validator).unwrap();
    let root_hs = legacy_root(0, 0);
    let root_id = root_hs.id;
    db.reset(BlockHeaderStateHandle::Legacy(root_hs)).unwrap();
    let tip = legacy_child(root_id, 1, 0, 1, true);
    db.add(BlockStateHandle::Legacy(tip.clone()), false).unwrap();
    db.set_chain_head(BlockStateHandle::Legacy(tip)).unwrap();
    db.switch_from_legacy().unwrap();
    db.close().unwrap();

    let legacy_tree: ForkTree<LegacyBlockState> = ForkTree::new();
    assert!(matches!(
        legacy_tree.open(&path, &mut no_op_validator),
        Err(ForkDbError::BadMagic { .. })
    ));
}
