use pow_ledger::core::{Blockchain, BlockchainError, Transaction, TransactionError};
use pow_ledger::crypto::{verify_proof, KeyPair};

#[test]
fn alice_pays_bob() {
    let mut chain = Blockchain::with_difficulty(1);
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();

    let block = chain.mine_block(&alice.address()).unwrap();
    assert_eq!(block.index, 1);
    assert!(block.hash.starts_with('0'));
    assert_eq!(chain.get_balance(&alice.address()), 16);

    let mut tx = Transaction::new(&alice.address(), &bob.address(), 5, 1);
    tx.sign(&alice).unwrap();
    let txid = tx.id();
    chain.add_transaction(tx.clone()).unwrap();

    assert_eq!(chain.get_pending_transactions().len(), 1);
    assert_eq!(chain.get_available_balance(&alice.address()), 10);
    assert_eq!(chain.get_balance(&alice.address()), 16);

    let block = chain.mine_block(&alice.address()).unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.total_fees, 1);

    assert_eq!(chain.get_balance(&alice.address()), 27);
    assert_eq!(chain.get_balance(&bob.address()), 5);
    assert!(chain.get_pending_transactions().is_empty());
    assert!(chain.is_chain_valid());

    let record = chain.get_transaction(&txid).unwrap();
    assert_eq!(record.block_index, 2);
    assert_eq!(record.confirmations, 1);

    let proof = block.transaction_proof(&txid).unwrap();
    assert!(verify_proof(&txid, &proof, &block.merkle_root));

    // resubmitting a confirmed transfer is a double spend
    assert!(matches!(
        chain.add_transaction(tx),
        Err(TransactionError::DoubleSpend(_))
    ));
    assert!(chain.get_pending_transactions().is_empty());

    let stats = chain.stats();
    assert_eq!(stats.total_blocks, 3);
    assert_eq!(stats.total_coins, 32);
    assert_eq!(stats.spent_tx_count, 1);
}

#[test]
fn overspending_is_rejected() {
    let mut chain = Blockchain::with_difficulty(1);
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    chain.mine_block(&alice.address()).unwrap();

    let mut first = Transaction::new(&alice.address(), &bob.address(), 10, 1);
    first.sign(&alice).unwrap();
    chain.add_transaction(first).unwrap();

    // 11 of 16 is already pending
    let mut second = Transaction::new(&alice.address(), &bob.address(), 5, 1);
    second.sign(&alice).unwrap();
    assert!(matches!(
        chain.add_transaction(second),
        Err(TransactionError::InsufficientBalance { .. })
    ));
    assert_eq!(chain.get_pending_transactions().len(), 1);
}

#[test]
fn longer_valid_chain_replaces_local() {
    let miner_a = KeyPair::generate();
    let miner_b = KeyPair::generate();

    let mut local = Blockchain::with_difficulty(1);
    local.mine_block(&miner_a.address()).unwrap();

    let mut remote = Blockchain::with_difficulty(1);
    for _ in 0..3 {
        remote.mine_block(&miner_b.address()).unwrap();
    }

    let mut tampered = remote.blocks().to_vec();
    tampered[2].nonce += 1;
    assert!(matches!(
        local.receive_chain(tampered),
        Err(BlockchainError::InvalidChain(_))
    ));
    assert_eq!(local.height(), 1);

    local.receive_chain(remote.blocks().to_vec()).unwrap();
    assert_eq!(local.height(), 3);
    assert_eq!(local.get_balance(&miner_a.address()), 0);
    assert_eq!(local.get_balance(&miner_b.address()), 48);

    assert!(matches!(
        local.receive_chain(remote.blocks()[..2].to_vec()),
        Err(BlockchainError::ChainNotLonger { .. })
    ));
}

#[test]
fn respelled_confirmed_transfer_cannot_be_replayed() {
    let mut chain = Blockchain::with_difficulty(1);
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    chain.mine_block(&alice.address()).unwrap();
    chain.mine_block(&alice.address()).unwrap();

    let mut tx = Transaction::new(&alice.address(), &bob.address(), 5, 1);
    tx.sign(&alice).unwrap();
    chain.add_transaction(tx.clone()).unwrap();
    chain.mine_block(&bob.address()).unwrap();
    assert_eq!(chain.get_balance(&alice.address()), 26);

    let mut replay = tx.clone();
    let signature = tx.signature.clone().unwrap().to_uppercase();
    replay.txid = Some(pow_ledger::core::derive_txid(
        &tx.calculate_hash(),
        &signature,
    ));
    replay.signature = Some(signature);

    assert!(matches!(
        chain.add_transaction(replay),
        Err(TransactionError::InvalidSignature)
    ));
    assert!(chain.get_pending_transactions().is_empty());
    assert_eq!(chain.get_balance(&alice.address()), 26);
}

#[test]
fn uppercase_recipient_is_rejected() {
    let mut chain = Blockchain::with_difficulty(1);
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    chain.mine_block(&alice.address()).unwrap();

    let mut tx = Transaction::new(&alice.address(), &bob.address().to_uppercase(), 5, 1);
    tx.sign(&alice).unwrap();
    assert!(matches!(
        chain.add_transaction(tx),
        Err(TransactionError::InvalidAddress(_))
    ));
    assert_eq!(chain.get_available_balance(&alice.address()), 16);
}
