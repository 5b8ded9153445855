#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use powd::load::{FixedProbe, LoadSample};
use powd::miner::MinerConfig;
use powd::node::{Collaborators, ManualClock};
use powd::{Node, NodeOptions};
use powd_consensus::params::{consensus_params, Network};
use powd_primitives::block::Block;
use powd_primitives::crypto::{sign_inputs, EcdsaVerifier, KeySigner, Signer};
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::{Transaction, TxIn, TxOut};
use powd_storage::memory::MemoryStore;

pub const GENESIS_TIME: i64 = 1_767_225_600;

pub struct TestNode {
    pub node: Arc<Node>,
    pub clock: Arc<ManualClock>,
    pub signer: KeySigner,
}

pub fn signer(seed: u8) -> KeySigner {
    KeySigner::from_secret_bytes(&[seed; 32]).expect("valid secret")
}

pub fn test_node(seed: u8) -> TestNode {
    let signer = signer(seed);
    let clock = Arc::new(ManualClock::new(GENESIS_TIME));
    let options = NodeOptions {
        mempool_max_txs: 100,
        max_peers: 8,
        miner: MinerConfig {
            max_workers: 2,
            deadline: Some(Duration::from_secs(30)),
            ..MinerConfig::default()
        },
        mining_owner: Some(signer.owner()),
        coin: "POW".to_string(),
    };
    let collaborators = Collaborators {
        verifier: Arc::new(EcdsaVerifier),
        probe: Arc::new(FixedProbe(LoadSample {
            cpu_busy: 0.0,
            memory_available: 1.0,
            cores: 2,
        })),
        clock: clock.clone(),
    };
    let node = Node::open_with(
        consensus_params(Network::Regtest),
        Arc::new(MemoryStore::new()),
        options,
        collaborators,
    )
    .expect("open node");
    TestNode {
        node: Arc::new(node),
        clock,
        signer,
    }
}

impl TestNode {
    /// Mines `count` blocks, `spacing` seconds apart on the node's clock.
    pub fn mine_spaced(&self, count: usize, spacing: i64) -> Vec<Block> {
        (0..count)
            .map(|_| {
                self.clock.advance(spacing);
                let outcome = self.node.mine_block().expect("mine block");
                assert!(outcome.moved_tip(), "mined block did not connect: {outcome:?}");
                self.tip_block()
            })
            .collect()
    }

    pub fn mine(&self, count: usize) -> Vec<Block> {
        self.mine_spaced(count, 10)
    }

    pub fn tip_block(&self) -> Block {
        let tip = self.node.tip();
        self.node
            .get_block(&tip.hash)
            .expect("read tip")
            .expect("tip block stored")
    }
}

/// Spends output 0 of `funding`'s coinbase, paying `value` back to `signer`.
pub fn spend_coinbase(funding: &Block, value: i64, signer: &KeySigner) -> Transaction {
    let coinbase = &funding.transactions[0];
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxIn::unsigned(OutPoint::new(coinbase.txid(), 0))],
        outputs: vec![TxOut {
            value,
            owner: signer.owner(),
            coin: "POW".to_string(),
        }],
        lock_height: 0,
    };
    sign_inputs(&mut tx, &[0], signer).expect("sign");
    tx
}

pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
