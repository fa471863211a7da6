//! Fork switching and irreversibility across competing branches.

mod common;

use meterchain_engine::Controller;
use meterchain_primitives::{ChainError, SignedBlock, SignedTransaction};

use common::*;

fn produce_block_at(chain: &mut Controller, timestamp_ms: u64, trxs: &[SignedTransaction]) -> SignedBlock {
    chain.start_block(timestamp_ms, PRODUCER).unwrap();
    for trx in trxs {
        chain.push_transaction(trx, None).unwrap();
    }
    let block = chain.finalize_block(&producer_key()).unwrap();
    chain.commit_block().unwrap();
    block
}

/// Two producers sharing block #2. Branch A adds block #3; branch B skips
/// a slot and adds #3' and #4'.
struct Branches {
    bootstrap: SignedBlock,
    a: Controller,
    a_blocks: Vec<SignedBlock>,
    b: Controller,
    b_blocks: Vec<SignedBlock>,
}

fn branches() -> Branches {
    let (alice, alice_sk) = alice();
    let (bob, bob_sk) = bob();

    let (mut a, bootstrap) = bootstrapped_chain(test_config());
    let trx = signed_trx(&a, vec![put(alice, 1, b"branch a")], &[&alice_sk], 1);
    let a_blocks = vec![produce_block(&mut a, &[trx]).0];

    let (mut b, _) = bootstrapped_chain(test_config());
    let trx = signed_trx(&b, vec![put(bob, 2, b"branch b")], &[&bob_sk], 2);
    let skipped = next_timestamp(&b) + BLOCK_INTERVAL_MS;
    let mut b_blocks = vec![produce_block_at(&mut b, skipped, &[trx])];
    let trx = signed_trx(&b, vec![put(bob, 3, b"more")], &[&bob_sk], 3);
    b_blocks.push(produce_block(&mut b, &[trx]).0);

    Branches {
        bootstrap,
        a,
        a_blocks,
        b,
        b_blocks,
    }
}

fn node_on_branch_a(branches: &Branches) -> Controller {
    let mut node = empty_chain(test_config());
    node.push_block(branches.bootstrap.clone()).unwrap();
    for block in &branches.a_blocks {
        node.push_block(block.clone()).unwrap();
    }
    node
}

#[test]
fn test_switch_to_longer_branch() {
    let branches = branches();
    let mut node = node_on_branch_a(&branches);
    let a_head = node.head_block_state().id;

    // Equal height: the current head stays.
    node.push_block(branches.b_blocks[0].clone()).unwrap();
    assert_eq!(node.head_block_state().id, a_head);
    assert_eq!(node.fork_db().len(), 4);

    node.push_block(branches.b_blocks[1].clone()).unwrap();
    assert_eq!(node.head_block_state().id, branches.b_blocks[1].id());
    assert_eq!(node.head_block_state().block_num, 4);
    assert_eq!(node.store().snapshot(), branches.b.store().snapshot());

    assert_eq!(node.get_row(KV, KV, ROWS, 1).unwrap(), None);
    assert_eq!(node.get_row(KV, KV, ROWS, 2).unwrap(), Some(b"branch b".to_vec()));
    assert_eq!(node.get_row(KV, KV, ROWS, 3).unwrap(), Some(b"more".to_vec()));
}

#[test]
fn test_failed_switch_restores_previous_branch() {
    let branches = branches();
    let mut node = node_on_branch_a(&branches);
    let a_head = node.head_block_state().id;

    // An invalid #3' with a validly signed child on top of it.
    let mut forged = branches.b_blocks[0].clone();
    forged.transactions[0].header.cpu_usage_us += 1;
    forged.sign(&producer_key());
    let mut child = branches.b_blocks[1].clone();
    child.header.previous = forged.id();
    child.sign(&producer_key());

    node.push_block(forged.clone()).unwrap();
    assert_eq!(node.head_block_state().id, a_head);

    let err = node.push_block(child.clone()).unwrap_err();
    assert!(matches!(err, ChainError::InvalidBlock(_)));
    assert_eq!(node.head_block_state().id, a_head);
    assert_eq!(node.store().snapshot(), branches.a.store().snapshot());
    assert!(node.fork_db().get(&forged.id()).is_none());
    assert!(node.fork_db().get(&child.id()).is_none());

    // The node keeps building on branch A.
    let (alice, alice_sk) = alice();
    let trx = signed_trx(&node, vec![put(alice, 4, b"after")], &[&alice_sk], 4);
    let (_, traces) = produce_block(&mut node, &[trx]);
    assert!(traces[0].is_included());
    assert_eq!(node.head_block_state().block_num, 4);
}

#[test]
fn test_failed_switch_keeps_fork_head_on_applied_branch() {
    let branches = branches();
    let mut node = node_on_branch_a(&branches);
    let a_head = node.head_block_state().id;

    // A valid #3' at equal height, then an invalid #4' on top of it.
    node.push_block(branches.b_blocks[0].clone()).unwrap();
    let mut forged = branches.b_blocks[1].clone();
    forged.transactions[0].header.cpu_usage_us += 1;
    forged.sign(&producer_key());
    assert!(matches!(
        node.push_block(forged),
        Err(ChainError::InvalidBlock(_))
    ));
    assert_eq!(node.head_block_state().id, a_head);
    assert_eq!(node.fork_db_head().id, a_head);

    // Irreversibility follows the applied branch.
    let root = node.advance_irreversible(0).unwrap().unwrap();
    assert_eq!(root.id, a_head);
    assert!(node.fork_db().get(&branches.b_blocks[0].id()).is_none());
    assert_eq!(node.store().snapshot(), branches.a.store().snapshot());

    let (alice, alice_sk) = alice();
    let trx = signed_trx(&node, vec![put(alice, 4, b"after")], &[&alice_sk], 4);
    let (block, traces) = produce_block(&mut node, &[trx]);
    assert!(traces[0].is_included());
    assert_eq!(block.previous(), a_head);
    assert_eq!(node.fork_db_head().id, block.id());
}

#[test]
fn test_switch_back_and_forth() {
    let branches = branches();
    let mut node = node_on_branch_a(&branches);
    for block in &branches.b_blocks {
        node.push_block(block.clone()).unwrap();
    }
    assert_eq!(node.store().snapshot(), branches.b.store().snapshot());

    // Branch A overtakes with two more blocks.
    let mut a = branches.a;
    let extension = vec![produce_empty_block(&mut a), produce_empty_block(&mut a)];
    for block in extension {
        node.push_block(block).unwrap();
    }
    assert_eq!(node.head_block_state().id, a.head_block_state().id);
    assert_eq!(node.store().snapshot(), a.store().snapshot());
}

#[test]
fn test_blocks_below_irreversible_are_unlinkable() {
    let mut config = test_config();
    config.schedule.irreversible_confirmations = 2;
    let (mut producer, bootstrap) = bootstrapped_chain(config.clone());
    let mut blocks = vec![bootstrap];
    for _ in 0..3 {
        blocks.push(produce_empty_block(&mut producer));
    }
    assert_eq!(producer.last_irreversible_block_num(), 3);

    let mut node = empty_chain(config);
    for block in &blocks {
        node.push_block(block.clone()).unwrap();
    }
    assert_eq!(node.head_block_state().block_num, 5);
    assert_eq!(node.last_irreversible_block_num(), 3);
    assert!(node.fork_db().get(&blocks[0].id()).is_none());

    // A competing block built on #2, which is now below the root.
    let branches = branches();
    let err = node.push_block(branches.b_blocks[0].clone()).unwrap_err();
    assert!(matches!(err, ChainError::UnlinkableBlock { .. }));
    assert_eq!(node.head_block_state().block_num, 5);
}
