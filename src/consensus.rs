use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::accounts::{Directory, KeyRing};
use crate::block::{Block, BlockCheck, BlockStatus, Vote};
use crate::blockchain::Ledger;
use crate::constants::QUORUM;
use crate::error::Result;
use crate::notification::Notifier;
use crate::pool::TransactionPool;
use crate::transaction::Transaction;
use crate::wallet::Identity;

/// What one call to `evaluate` did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No pending block to vote on.
    Idle,
    /// The actor proposed the block or already voted on it.
    Ineligible,
    /// Vote stored, no side has reached quorum yet.
    Voted(Vote),
    /// The block as persisted with status `Verified`.
    Committed(Block),
    /// The block that was removed from the chain, with status `Rejected`.
    Rejected(Block),
}

enum Step {
    Idle,
    Ineligible,
    Voted(Vote),
    Commit {
        block: Block,
        chain_len: usize,
        fee_transfers: Vec<Transaction>,
    },
    Reject {
        block: Block,
        requeue: Vec<Transaction>,
    },
}

/// Drives the pending block through vote -> commit/reject. There is no
/// background timer: whoever performs an activity check calls `evaluate`
/// (or `tick`) and thereby casts their vote.
pub struct ConsensusEngine {
    ledger: Ledger,
    pool: TransactionPool,
    directory: Arc<dyn Directory>,
    keys: Arc<dyn KeyRing>,
    notifier: Arc<dyn Notifier>,
    check: Arc<dyn BlockCheck>,
}

impl ConsensusEngine {
    pub fn new(
        ledger: Ledger,
        pool: TransactionPool,
        directory: Arc<dyn Directory>,
        keys: Arc<dyn KeyRing>,
        notifier: Arc<dyn Notifier>,
        check: Arc<dyn BlockCheck>,
    ) -> ConsensusEngine {
        ConsensusEngine {
            ledger,
            pool,
            directory,
            keys,
            notifier,
            check,
        }
    }

    /// Casts `actor`'s vote on the last block if it is pending and settles
    /// it once one side has `QUORUM` votes.
    pub fn evaluate(&self, actor: &str) -> Result<Outcome> {
        let step = self.ledger.update(|chain| self.vote(chain, actor))?;
        match step {
            Step::Idle => Ok(Outcome::Idle),
            Step::Ineligible => Ok(Outcome::Ineligible),
            Step::Voted(vote) => {
                debug!("{} voted {:?}, no quorum yet", actor, vote);
                Ok(Outcome::Voted(vote))
            }
            Step::Commit {
                block,
                chain_len,
                fee_transfers,
            } => {
                self.commit(&block, chain_len, fee_transfers);
                Ok(Outcome::Committed(block))
            }
            Step::Reject { block, requeue } => {
                self.reject(&block, requeue);
                Ok(Outcome::Rejected(block))
            }
        }
    }

    /// The periodic chores of an active user: vote on the pending block,
    /// then drop their own pooled transactions that no longer verify.
    pub fn tick(&self, actor: &str) -> Result<Outcome> {
        let outcome = self.evaluate(actor)?;
        // the vote already happened, so its outcome is returned regardless
        let cancelled = self
            .directory
            .public_key_of(actor)
            .and_then(|identity| self.pool.cancel_invalid(&identity));
        if let Err(e) = cancelled {
            warn!("could not tidy the pool of {}: {}", actor, e);
        }
        Ok(outcome)
    }

    // Runs inside the chain update and may be retried, so it only touches
    // `chain` and reads from the directory and key ring.
    fn vote(&self, chain: &mut Vec<Block>, actor: &str) -> Result<Step> {
        if chain.len() < 2 {
            return Ok(Step::Idle);
        }
        let last = chain.len() - 1;
        if chain[last].status.is_terminal() {
            return Ok(Step::Idle);
        }
        let proposer = self.proposer_name(&chain[last]);
        if proposer.as_deref() == Some(actor) || chain[last].has_voted(actor) {
            return Ok(Step::Ineligible);
        }

        let vote = if self.check.is_valid(&chain[last], &chain[last - 1], actor) {
            Vote::Valid
        } else {
            Vote::Invalid
        };
        chain[last].validators.push((actor.to_string(), vote));
        info!("{} voted {:?} on block {}", actor, vote, chain[last].id());

        if chain[last].validators.len() < QUORUM {
            return Ok(Step::Voted(vote));
        }
        let (valid, invalid) = chain[last].tally();
        if valid >= QUORUM {
            let fee_transfers = self.fee_transfers(&chain[last])?;
            chain[last].status = BlockStatus::Verified;
            Ok(Step::Commit {
                block: chain[last].clone(),
                chain_len: chain.len(),
                fee_transfers,
            })
        } else if invalid >= QUORUM {
            let mut block = chain.remove(last);
            block.status = BlockStatus::Rejected;
            let txs = block.get_transaction();
            // the trailing reward belongs to the rejected miner
            let requeue = txs[..txs.len().saturating_sub(1)].to_vec();
            Ok(Step::Reject { block, requeue })
        } else {
            Ok(Step::Voted(vote))
        }
    }

    /// One zero-fee transfer per paying transaction, moving its fee from the
    /// sender to the miner and signed with the sender's key.
    fn fee_transfers(&self, block: &Block) -> Result<Vec<Transaction>> {
        let miner = match block.miner() {
            Some(m) => m.clone(),
            None => return Ok(Vec::new()),
        };
        let mut transfers = Vec::new();
        for tx in block.get_transaction() {
            let sender = match tx.sender() {
                Some(s) if tx.fee > 0 => s,
                _ => continue,
            };
            let sender_name = self.directory.username_of(sender)?;
            let wallet = self.keys.wallet_of(&sender_name)?;
            transfers.push(Transaction::new_fee_transfer(&wallet, miner.clone(), tx.fee)?);
        }
        Ok(transfers)
    }

    // The chain already holds the verdict when this runs, so every step is
    // attempted and failures are only logged.
    fn commit(&self, block: &Block, chain_len: usize, fee_transfers: Vec<Transaction>) {
        info!("block {} verified", block.id());
        logged("pool fee transfers", self.pool.add_transactions(&fee_transfers));
        logged("settle block", self.ledger.settle(block.get_transaction()));

        for tx in block.get_transaction() {
            match tx.sender() {
                Some(sender) => {
                    let sender_name = self.name_of(sender);
                    let receiver_name = self.name_of(tx.receiver());
                    self.tell(
                        &sender_name,
                        &format!("successful transaction: {} coin(s) to {}", tx.amount(), receiver_name),
                    );
                    // Addressed to the receiver. Earlier nodes sent this one
                    // to the sender as well.
                    self.tell(
                        &receiver_name,
                        &format!(
                            "successful transaction received: {} coin(s) from {}",
                            tx.amount(),
                            sender_name
                        ),
                    );
                }
                None => self.tell(
                    &self.name_of(tx.receiver()),
                    &format!("reward of {} coin(s) added to your balance", tx.amount()),
                ),
            }
        }

        let proposer = self.proposer_name(block);
        let exclude = proposer.as_deref();
        logged(
            "broadcast verification",
            self.notifier
                .notify_all(&format!("block with id {} verified", block.id()), exclude),
        );
        logged(
            "broadcast chain size",
            self.notifier
                .notify_all(&format!("new size of blockchain: {}", chain_len), exclude),
        );
        if let Some(miner) = exclude {
            self.tell(
                miner,
                &format!(
                    "Your mined block with id {} status changed from {} to {}",
                    block.id(),
                    BlockStatus::Pending,
                    BlockStatus::Verified
                ),
            );
            self.tell(miner, &format!("Your mined block with id {} is verified", block.id()));
        }
    }

    fn reject(&self, block: &Block, requeue: Vec<Transaction>) {
        info!(
            "block {} rejected, {} transaction(s) back to the pool",
            block.id(),
            requeue.len()
        );
        logged("requeue transactions", self.pool.add_transactions(&requeue));
        if let Some(miner) = self.proposer_name(block) {
            self.tell(&miner, &format!("Your mined block with id {} is rejected", block.id()));
        }
    }

    fn tell(&self, username: &str, message: &str) {
        logged("notify", self.notifier.notify(username, message));
    }

    fn proposer_name(&self, block: &Block) -> Option<String> {
        block
            .miner()
            .and_then(|id| self.directory.username_of(id).ok())
    }

    fn name_of(&self, identity: &Identity) -> String {
        self.directory
            .username_of(identity)
            .unwrap_or_else(|_| identity.to_string())
    }
}

fn logged(step: &str, result: Result<()>) {
    if let Err(e) = result {
        error!("{} failed: {}", step, e);
    }
}
