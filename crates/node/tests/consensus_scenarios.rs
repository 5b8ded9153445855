mod common;

use std::sync::Barrier;

use common::{spend_coinbase, test_node, GENESIS_TIME};
use powd::mempool::AddOutcome;
use powd::{BlockOutcome, BlockSource, NodeEvent};
use powd_chainstate::SyncState;
use powd_consensus::{block_reward, min_fee};

#[test]
fn first_mined_block_pays_the_height_reward() {
    let miner = test_node(1);
    assert_eq!(miner.node.height(), 0);

    let blocks = miner.mine(1);
    let block = &blocks[0];
    assert_eq!(miner.node.height(), 1);
    assert_eq!(block.header.height, 1);
    assert_eq!(block.transactions.len(), 1);
    assert!(block.transactions[0].is_coinbase());
    assert_eq!(
        block.transactions[0].outputs[0].value,
        block_reward(1, miner.node.params())
    );
    assert_eq!(miner.node.miner().blocks_found(), 1);
}

#[test]
fn equal_work_tips_keep_the_first_seen_block() {
    let left = test_node(1);
    let right = test_node(2);
    let ours = left.mine(1);
    let theirs = right.mine(1);

    let outcome = left
        .node
        .process_block(theirs[0].clone(), theirs[0].hash(), BlockSource::Announced(1))
        .expect("fork block accepted for evaluation");
    assert_eq!(outcome, BlockOutcome::Discarded);
    assert_eq!(left.node.tip().hash, ours[0].hash());
    assert_eq!(left.node.sync_state(), SyncState::Synced);

    let outcome = right
        .node
        .process_block(ours[0].clone(), ours[0].hash(), BlockSource::Announced(1))
        .expect("fork block accepted for evaluation");
    assert_eq!(outcome, BlockOutcome::Discarded);
    assert_eq!(right.node.tip().hash, theirs[0].hash());
}

#[test]
fn low_fee_transaction_is_rejected_and_never_pooled() {
    let miner = test_node(3);
    let blocks = miner.mine(10);
    let mut events = miner.node.subscribe();

    let reward = block_reward(1, miner.node.params());
    let free = spend_coinbase(&blocks[0], reward, &miner.signer);
    let err = miner
        .node
        .submit_transaction(free.clone(), None)
        .expect_err("zero fee rejected");
    assert!(err.is_rejection());
    assert!(!miner.node.mempool().contains(&free.txid()));
    assert!(miner.node.mempool().is_empty());
    assert!(events.try_recv().is_err());

    let paying = spend_coinbase(&blocks[0], reward - 1_000, &miner.signer);
    assert!(min_fee(paying.size(), miner.node.params()) <= 1_000);
    assert_eq!(
        miner.node.submit_transaction(paying.clone(), None).expect("valid"),
        AddOutcome::Added
    );
    assert_eq!(
        miner.node.submit_transaction(paying.clone(), None).expect("again"),
        AddOutcome::AlreadyPresent
    );
    assert_eq!(miner.node.mempool().len(), 1);
    match events.try_recv().expect("announced once") {
        NodeEvent::NewTransaction { tx, origin } => {
            assert_eq!(tx.txid(), paying.txid());
            assert_eq!(origin, None);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let block = miner.mine(1).remove(0);
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(block.transactions[1].txid(), paying.txid());
    assert!(miner.node.mempool().is_empty());
}

#[test]
fn fast_blocks_double_the_difficulty_at_the_retarget() {
    let miner = test_node(4);
    let interval = u64::from(miner.node.params().difficulty_adjustment_interval);

    // Everything below the second retarget boundary arrives twice as fast
    // as the target spacing.
    let spacing = miner.node.params().target_spacing_secs / 2;
    miner.mine_spaced((2 * interval - 2) as usize, spacing);
    assert_eq!(miner.node.height(), 2 * interval - 2);

    let before = miner.node.difficulty();
    miner.mine_spaced(1, spacing);
    let after = miner.node.difficulty();
    let ratio = after / before;
    assert!(
        (ratio - 2.0).abs() < 0.01,
        "difficulty moved from {before} to {after} (ratio {ratio})"
    );
    assert_ne!(miner.node.status().next_bits, miner.tip_block().header.bits);
    assert_eq!(
        i64::from(miner.node.tip().time),
        GENESIS_TIME + (2 * interval as i64 - 1) * spacing
    );
}

#[test]
fn reorg_returns_disconnected_transactions_to_the_pool() {
    let left = test_node(5);
    let right = test_node(6);
    let shared = left.mine(10);
    for block in &shared {
        right
            .node
            .process_block(block.clone(), block.hash(), BlockSource::Synced(1))
            .expect("sync shared prefix");
    }
    right.clock.set(left.node.now());

    let reward = block_reward(1, left.node.params());
    let tx = spend_coinbase(&shared[0], reward - 5_000, &left.signer);
    left.node.submit_transaction(tx.clone(), None).expect("pooled");
    let confirmed = left.mine(1).remove(0);
    assert_eq!(confirmed.transactions.len(), 2);
    assert!(left.node.mempool().is_empty());

    right.clock.advance(3);
    let fork = right.mine_spaced(2, 7);
    let _ = left
        .node
        .process_block(fork[0].clone(), fork[0].hash(), BlockSource::Announced(2))
        .expect("first fork block");
    let outcome = left
        .node
        .process_block(fork[1].clone(), fork[1].hash(), BlockSource::Announced(2))
        .expect("heavier fork");
    assert!(matches!(
        outcome,
        BlockOutcome::Reorganized {
            disconnected: 1,
            connected: 2,
            ..
        }
    ));
    assert_eq!(left.node.tip().hash, fork[1].hash());
    assert!(left.node.mempool().contains(&tx.txid()));
}

#[test]
fn transaction_confirmed_while_submitted_never_stays_pooled() {
    for round in 0..8u8 {
        let left = test_node(40 + round);
        let right = test_node(60 + round);
        let shared = left.mine(10);
        for block in &shared {
            right
                .node
                .process_block(block.clone(), block.hash(), BlockSource::Synced(1))
                .expect("sync shared prefix");
        }

        let reward = block_reward(1, left.node.params());
        let tx = spend_coinbase(&shared[0], reward - 5_000, &left.signer);
        left.node.submit_transaction(tx.clone(), None).expect("pooled");
        let confirming = left.mine(1).remove(0);
        right.clock.set(left.node.now());

        let node = &right.node;
        let barrier = Barrier::new(2);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                let _ = node.submit_transaction(tx.clone(), None);
            });
            scope.spawn(|| {
                barrier.wait();
                node.process_block(
                    confirming.clone(),
                    confirming.hash(),
                    BlockSource::Announced(1),
                )
                .expect("confirming block");
            });
        });

        assert_eq!(node.tip().hash, confirming.hash());
        assert!(!node.mempool().contains(&tx.txid()), "round {round}");
        assert!(node.mempool().is_empty());
    }
}
