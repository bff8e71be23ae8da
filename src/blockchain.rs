use std::sync::Arc;

use log::info;

use crate::block::{Block, BlockStatus};
use crate::constants::{CHAIN_SLOT, HISTORY_SLOT};
use crate::error::{Error, Result};
use crate::storage::{Slot, Store};
use crate::transaction::Transaction;

/// The persisted chain plus the flat history of settled transactions.
/// Only the last block may be pending; rejected blocks are dropped from
/// the chain instead of being kept.
#[derive(Clone)]
pub struct Ledger {
    chain: Slot<Block>,
    history: Slot<Transaction>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Ledger {
        Ledger {
            chain: Slot::new(Arc::clone(&store), CHAIN_SLOT),
            history: Slot::new(store, HISTORY_SLOT),
        }
    }

    pub fn create_blockchain(&self) -> Result<Block> {
        info!("creating new blockchain");
        let genesis = Block::new_genesis_block()?;
        self.chain.update(|blocks| {
            if !blocks.is_empty() {
                return Err(Error::ChainExists);
            }
            blocks.push(genesis.clone());
            Ok(())
        })?;
        Ok(genesis)
    }

    pub fn blocks(&self) -> Result<Vec<Block>> {
        self.chain.load()
    }

    pub fn last_block(&self) -> Result<Option<Block>> {
        Ok(self.chain.load()?.pop())
    }

    pub fn add_block(&self, block: Block) -> Result<()> {
        info!("add block {} to the chain", block.id());
        self.chain.update(|blocks| {
            match blocks.last() {
                None => return Err(Error::NoChain),
                Some(last) if last.is_pending() => return Err(Error::BlockPending),
                Some(last) if block.get_prev_hash() != last.get_hash() => {
                    return Err(Error::Unlinked(block.id()))
                }
                Some(_) => {}
            }
            blocks.push(block.clone());
            Ok(())
        })
    }

    /// Overwrites the last block with a newer copy of itself and returns the
    /// status it had before.
    pub fn replace_last(&self, block: Block) -> Result<BlockStatus> {
        self.chain.update(|blocks| {
            let last = blocks.last_mut().ok_or(Error::NoChain)?;
            if last.get_hash() != block.get_hash() {
                return Err(Error::NotLastBlock(block.id()));
            }
            let before = last.status;
            *last = block.clone();
            Ok(before)
        })
    }

    pub fn remove_block(&self, index: usize) -> Result<Option<Block>> {
        self.chain.update(|blocks| {
            if index < blocks.len() {
                Ok(Some(blocks.remove(index)))
            } else {
                Ok(None)
            }
        })
    }

    /// Whole-chain read-modify-write, see `Slot::update`.
    pub fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnMut(&mut Vec<Block>) -> Result<R>,
    {
        self.chain.update(f)
    }

    pub fn history(&self) -> Result<Vec<Transaction>> {
        self.history.load()
    }

    /// Appends the transactions of a committed block to settled history.
    pub fn settle(&self, transactions: &[Transaction]) -> Result<()> {
        self.history.update(|history| {
            history.extend_from_slice(transactions);
            Ok(())
        })
    }
}
