use log::{info, warn};

use crate::block::Block;
use crate::blockchain::Ledger;
use crate::constants::{MAX_BLOCK_TRANSACTIONS, MINING_REWARD, MIN_BLOCK_TRANSACTIONS};
use crate::error::{Error, Result};
use crate::pool::TransactionPool;
use crate::transaction::Transaction;
use crate::wallet::Wallet;

/// Assembles pooled transactions into a new pending block.
#[derive(Clone)]
pub struct Miner {
    ledger: Ledger,
    pool: TransactionPool,
}

impl Miner {
    pub fn new(ledger: Ledger, pool: TransactionPool) -> Miner {
        Miner { ledger, pool }
    }

    /// Takes verifiable transactions from the pool, appends the miner's
    /// reward and adds the block to the chain as pending. Refused while the
    /// last block is still being voted on.
    pub fn mine_block(&self, miner: &Wallet) -> Result<Block> {
        let last = self.ledger.last_block()?.ok_or(Error::NoChain)?;
        if last.is_pending() {
            return Err(Error::BlockPending);
        }

        let mut txs = self.pool.take_valid(MAX_BLOCK_TRANSACTIONS)?;
        if txs.len() < MIN_BLOCK_TRANSACTIONS {
            self.pool.add_transactions(&txs)?;
            return Err(Error::EmptyBlock);
        }
        let taken = txs.len();
        txs.push(Transaction::new_reward(miner, MINING_REWARD)?);

        let block = Block::new_block(last.id() + 1, txs, last.get_hash())?;
        if let Err(e) = self.ledger.add_block(block.clone()) {
            warn!("could not append mined block: {}", e);
            self.pool.add_transactions(&block.get_transaction()[..taken])?;
            return Err(e);
        }
        info!("mined block {} with {} transaction(s)", block.id(), taken);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStatus;
    use crate::storage::{SledStore, Store};
    use std::sync::Arc;

    fn setup() -> (Ledger, TransactionPool, Miner) {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let ledger = Ledger::new(Arc::clone(&store));
        let pool = TransactionPool::new(store);
        let miner = Miner::new(ledger.clone(), pool.clone());
        (ledger, pool, miner)
    }

    #[test]
    fn mined_block_ends_with_reward_and_empties_pool() {
        let (ledger, pool, miner) = setup();
        let genesis = ledger.create_blockchain().unwrap();
        let m = Wallet::generate();
        let a = Wallet::generate();
        let tx = Transaction::new_transfer(&a, m.identity(), 3, 1).unwrap();
        pool.add_transaction(tx.clone()).unwrap();

        let block = miner.mine_block(&m).unwrap();
        assert_eq!(block.status, BlockStatus::Pending);
        assert_eq!(block.get_prev_hash(), genesis.get_hash());
        assert_eq!(block.get_transaction()[0], tx);
        assert_eq!(block.miner(), Some(&m.identity()));
        assert_eq!(block.get_transaction()[1].amount(), MINING_REWARD);
        assert!(pool.transactions().unwrap().is_empty());
        assert_eq!(ledger.blocks().unwrap().len(), 2);
    }

    #[test]
    fn refuses_without_chain_empty_pool_or_pending_block() {
        let (ledger, pool, miner) = setup();
        let m = Wallet::generate();
        assert!(matches!(miner.mine_block(&m), Err(Error::NoChain)));
        ledger.create_blockchain().unwrap();
        assert!(matches!(miner.mine_block(&m), Err(Error::EmptyBlock)));

        let a = Wallet::generate();
        pool.add_transaction(Transaction::new_transfer(&a, m.identity(), 1, 1).unwrap())
            .unwrap();
        miner.mine_block(&m).unwrap();
        let late = Transaction::new_transfer(&a, m.identity(), 2, 1).unwrap();
        pool.add_transaction(late.clone()).unwrap();
        assert!(matches!(miner.mine_block(&m), Err(Error::BlockPending)));
        assert_eq!(pool.transactions().unwrap(), vec![late]);
    }
}
