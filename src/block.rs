use std::fmt;
use std::time::SystemTime;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{MINING_REWARD, REGISTRATION_REWARD};
use crate::error::Result;
use crate::transaction::Transaction;
use crate::wallet::Identity;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Pending,
    Verified,
    Rejected,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        self != BlockStatus::Pending
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Verified => "verified",
            BlockStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Valid,
    Invalid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id: u64,
    timestamp: u128,
    // the miner's reward is conventionally the last one
    transactions: Vec<Transaction>,
    prev_block_hash: String,
    hash: String,
    pub status: BlockStatus,
    pub validators: Vec<(String, Vote)>,
}

impl Block {
    pub fn new_block(id: u64, transactions: Vec<Transaction>, prev_block_hash: String) -> Result<Block> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut block = Block {
            id,
            timestamp,
            transactions,
            prev_block_hash,
            hash: String::new(),
            status: BlockStatus::Pending,
            validators: Vec::new(),
        };
        block.hash = block.compute_hash()?;
        debug!("new block {} hash {}", block.id, block.hash);
        Ok(block)
    }

    /// The genesis block is born verified and carries no transactions.
    pub fn new_genesis_block() -> Result<Block> {
        let mut genesis = Block::new_block(0, Vec::new(), String::new())?;
        genesis.status = BlockStatus::Verified;
        Ok(genesis)
    }

    fn compute_hash(&self) -> Result<String> {
        let content = (
            self.id,
            self.timestamp,
            &self.transactions,
            &self.prev_block_hash,
        );
        let bytes = bincode::serialize(&content)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get_transaction(&self) -> &Vec<Transaction> {
        &self.transactions
    }

    pub fn get_hash(&self) -> String {
        self.hash.clone()
    }

    pub fn get_prev_hash(&self) -> String {
        self.prev_block_hash.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.status == BlockStatus::Pending
    }

    /// Recipient of the trailing reward transaction.
    pub fn miner(&self) -> Option<&Identity> {
        self.transactions
            .last()
            .filter(|tx| tx.is_reward())
            .map(|tx| tx.receiver())
    }

    pub fn has_voted(&self, voter: &str) -> bool {
        self.validators.iter().any(|(v, _)| v == voter)
    }

    pub fn tally(&self) -> (usize, usize) {
        self.validators
            .iter()
            .fold((0, 0), |(valid, invalid), (_, vote)| match vote {
                Vote::Valid => (valid + 1, invalid),
                Vote::Invalid => (valid, invalid + 1),
            })
    }
}

/// Per-voter content check of a pending block against its predecessor.
pub trait BlockCheck: Send + Sync {
    fn is_valid(&self, block: &Block, previous: &Block, voter: &str) -> bool;
}

/// Linkage, hash integrity, signatures and a trailing miner reward.
/// Rewards carry fixed amounts: `MINING_REWARD` for the trailing one,
/// `REGISTRATION_REWARD` for any sign-up reward before it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralCheck;

impl BlockCheck for StructuralCheck {
    fn is_valid(&self, block: &Block, previous: &Block, voter: &str) -> bool {
        if block.prev_block_hash != previous.hash {
            info!("{voter}: block {} does not link to block {}", block.id, previous.id);
            return false;
        }
        match block.compute_hash() {
            Ok(h) if h == block.hash => {}
            _ => {
                info!("{voter}: block {} hash mismatch", block.id);
                return false;
            }
        }
        if block.miner().is_none() {
            info!("{voter}: block {} does not end with a reward", block.id);
            return false;
        }
        let last = block.transactions.len() - 1;
        let minted = block.transactions.iter().enumerate().find(|(i, tx)| {
            let allowed = if *i == last { MINING_REWARD } else { REGISTRATION_REWARD };
            tx.is_reward() && tx.amount() != allowed
        });
        if let Some((i, tx)) = minted {
            info!("{voter}: block {} reward {} has amount {}", block.id, i, tx.amount());
            return false;
        }
        if let Some(bad) = block.transactions.iter().position(|tx| !tx.verify()) {
            info!("{voter}: block {} transaction {} fails verification", block.id, bad);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn mined(previous: &Block, miner: &Wallet, extra: Vec<Transaction>) -> Block {
        let mut txs = extra;
        txs.push(Transaction::new_reward(miner, MINING_REWARD).unwrap());
        Block::new_block(previous.id() + 1, txs, previous.get_hash()).unwrap()
    }

    #[test]
    fn genesis_is_terminal() {
        let g = Block::new_genesis_block().unwrap();
        assert!(g.status.is_terminal());
        assert!(g.miner().is_none());
    }

    #[test]
    fn miner_is_reward_recipient() {
        let g = Block::new_genesis_block().unwrap();
        let miner = Wallet::generate();
        let b = mined(&g, &miner, Vec::new());
        assert_eq!(b.miner(), Some(&miner.identity()));
        assert!(b.is_pending());
    }

    #[test]
    fn structural_check_accepts_well_formed_block() {
        let g = Block::new_genesis_block().unwrap();
        let miner = Wallet::generate();
        let alice = Wallet::generate();
        let tx = Transaction::new_transfer(&alice, miner.identity(), 3, 1).unwrap();
        let b = mined(&g, &miner, vec![tx]);
        assert!(StructuralCheck.is_valid(&b, &g, "bob"));
    }

    #[test]
    fn sign_up_rewards_may_precede_the_miner_reward() {
        let g = Block::new_genesis_block().unwrap();
        let miner = Wallet::generate();
        let newcomer = Wallet::generate();
        let signup = Transaction::new_reward(&newcomer, REGISTRATION_REWARD).unwrap();
        let b = mined(&g, &miner, vec![signup]);
        assert_eq!(b.miner(), Some(&miner.identity()));
        assert!(StructuralCheck.is_valid(&b, &g, "bob"));

        let unrewarded = Block::new_block(1, Vec::new(), g.get_hash()).unwrap();
        assert!(!StructuralCheck.is_valid(&unrewarded, &g, "bob"));
    }

    #[test]
    fn self_minted_reward_amounts_are_invalid() {
        let g = Block::new_genesis_block().unwrap();
        let miner = Wallet::generate();
        let greedy = Wallet::generate();
        let minted = Transaction::new_reward(&greedy, 1_000_000).unwrap();
        assert!(minted.verify());
        assert!(!StructuralCheck.is_valid(&mined(&g, &miner, vec![minted]), &g, "bob"));

        let overpaid = Transaction::new_reward(&miner, MINING_REWARD + 1).unwrap();
        let b = Block::new_block(1, vec![overpaid], g.get_hash()).unwrap();
        assert!(!StructuralCheck.is_valid(&b, &g, "bob"));
    }

    #[test]
    fn structural_check_rejects_bad_link_and_bad_signature() {
        let g = Block::new_genesis_block().unwrap();
        let other = Block::new_block(7, Vec::new(), "elsewhere".to_string()).unwrap();
        let miner = Wallet::generate();
        let b = mined(&g, &miner, Vec::new());
        assert!(!StructuralCheck.is_valid(&b, &other, "bob"));

        let alice = Wallet::generate();
        let mut forged = Transaction::new_transfer(&alice, miner.identity(), 3, 1).unwrap();
        forged.output.amount = 300;
        forged.input.as_mut().unwrap().amount = 300;
        let b = mined(&g, &miner, vec![forged]);
        assert!(!StructuralCheck.is_valid(&b, &g, "bob"));
    }

    #[test]
    fn tally_counts_each_side() {
        let g = Block::new_genesis_block().unwrap();
        let mut b = mined(&g, &Wallet::generate(), Vec::new());
        b.validators.push(("a".into(), Vote::Valid));
        b.validators.push(("b".into(), Vote::Invalid));
        b.validators.push(("c".into(), Vote::Valid));
        assert_eq!(b.tally(), (2, 1));
        assert!(b.has_voted("b"));
        assert!(!b.has_voted("d"));
    }
}
