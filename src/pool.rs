use std::sync::Arc;

use log::{info, warn};

use crate::accounts::{normalize_username, validate_username, Directory, KeyRing};
use crate::balance::available;
use crate::blockchain::Ledger;
use crate::constants::POOL_SLOT;
use crate::error::{Error, Result};
use crate::storage::{Slot, Store};
use crate::transaction::Transaction;
use crate::wallet::Identity;

/// Signed transactions waiting to be mined, in arrival order.
#[derive(Clone)]
pub struct TransactionPool {
    slot: Slot<Transaction>,
}

impl TransactionPool {
    pub fn new(store: Arc<dyn Store>) -> TransactionPool {
        TransactionPool {
            slot: Slot::new(store, POOL_SLOT),
        }
    }

    pub fn transactions(&self) -> Result<Vec<Transaction>> {
        self.slot.load()
    }

    pub fn add_transaction(&self, tx: Transaction) -> Result<()> {
        self.add_transactions(std::slice::from_ref(&tx))
    }

    pub fn add_transactions(&self, txs: &[Transaction]) -> Result<()> {
        self.slot.update(|pool| {
            pool.extend_from_slice(txs);
            Ok(())
        })
    }

    /// Removes the first copy of `tx`; false when it was not pooled.
    pub fn remove_transaction(&self, tx: &Transaction) -> Result<bool> {
        self.slot.update(|pool| match pool.iter().position(|p| p == tx) {
            Some(i) => {
                pool.remove(i);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    pub fn remove_transactions(&self, txs: &[Transaction]) -> Result<usize> {
        self.slot.update(|pool| {
            let mut removed = 0;
            for tx in txs {
                if let Some(i) = pool.iter().position(|p| p == tx) {
                    pool.remove(i);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Transactions spending from `identity`.
    pub fn user_transactions(&self, identity: &Identity) -> Result<Vec<Transaction>> {
        Ok(self
            .slot
            .load()?
            .into_iter()
            .filter(|tx| tx.sender() == Some(identity))
            .collect())
    }

    /// Takes up to `max` verifiable transactions out of the pool, oldest
    /// first.
    pub fn take_valid(&self, max: usize) -> Result<Vec<Transaction>> {
        self.slot.update(|pool| {
            let mut taken = Vec::new();
            let mut rest = Vec::with_capacity(pool.len());
            for tx in pool.drain(..) {
                if taken.len() < max && tx.verify() {
                    taken.push(tx);
                } else {
                    rest.push(tx);
                }
            }
            *pool = rest;
            Ok(taken)
        })
    }

    /// Drops the pooled transactions owned by `owner` whose signature does
    /// not verify.
    pub fn cancel_invalid(&self, owner: &Identity) -> Result<usize> {
        let removed = self.slot.update(|pool| {
            let before = pool.len();
            pool.retain(|tx| {
                let owned = tx.sender() == Some(owner) || (tx.is_reward() && tx.receiver() == owner);
                !owned || tx.verify()
            });
            Ok(before - pool.len())
        })?;
        if removed > 0 {
            warn!("cancelled {} invalid transaction(s) of {}", removed, owner);
        }
        Ok(removed)
    }
}

/// Which part of a pending transfer to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Receiver(String),
    Fee(u64),
    Amount(u64),
}

/// User-initiated pool mutations with the transfer policy applied.
#[derive(Clone)]
pub struct Payments {
    pool: TransactionPool,
    ledger: Ledger,
    directory: Arc<dyn Directory>,
    keys: Arc<dyn KeyRing>,
}

impl Payments {
    pub fn new(
        pool: TransactionPool,
        ledger: Ledger,
        directory: Arc<dyn Directory>,
        keys: Arc<dyn KeyRing>,
    ) -> Payments {
        Payments {
            pool,
            ledger,
            directory,
            keys,
        }
    }

    /// Checks and queues a transfer. The balance check and the insert happen
    /// in one pool update, so queued spends can never exceed the balance.
    pub fn transfer(&self, username: &str, receiver: &str, amount: u64, fee: u64) -> Result<Transaction> {
        let receiver = normalize_username(receiver);
        let sender = self.directory.public_key_of(username)?;
        let history = self.ledger.history()?;
        let wallet = self.keys.wallet_of(username)?;

        let tx = self.pool.slot.update(|pool| {
            let spendable = available(&sender, &history, pool.iter());
            self.check(username, &receiver, amount, fee, spendable)?;
            let receiver_key = self.directory.public_key_of(&receiver)?;
            let tx = Transaction::new_transfer(&wallet, receiver_key, amount, fee)?;
            if !tx.verify() {
                return Err(Error::InvalidSignature);
            }
            pool.push(tx.clone());
            Ok(tx)
        })?;
        info!("{} sends {} coin(s) to {} with fee {}", username, amount, receiver, fee);
        Ok(tx)
    }

    /// Rebuilds `original` with one field changed, signs it again and swaps
    /// it into the pool. The balance check leaves the original out. Nothing
    /// changes if any step fails.
    pub fn edit(&self, username: &str, original: &Transaction, edit: Edit) -> Result<Transaction> {
        let sender = self.directory.public_key_of(username)?;
        if original.sender() != Some(&sender) {
            return Err(Error::TransactionNotFound);
        }
        let mut receiver = self.directory.username_of(original.receiver())?;
        let mut amount = original.amount();
        let mut fee = original.fee;
        match edit {
            Edit::Receiver(name) => receiver = normalize_username(&name),
            Edit::Fee(f) => fee = f,
            Edit::Amount(a) => amount = a,
        }
        let history = self.ledger.history()?;
        let wallet = self.keys.wallet_of(username)?;

        let (old_amount, old_fee) = (original.amount(), original.fee);
        let replacement = self.pool.slot.update(|pool| {
            let index = pool
                .iter()
                .position(|tx| tx.matches(old_amount, &sender, original.receiver(), old_fee))
                .ok_or(Error::TransactionNotFound)?;
            let others = pool
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, tx)| tx);
            self.check(username, &receiver, amount, fee, available(&sender, &history, others))?;

            let receiver_key = self.directory.public_key_of(&receiver)?;
            let replacement = Transaction::new_transfer(&wallet, receiver_key, amount, fee)?;
            if !replacement.verify() {
                return Err(Error::InvalidSignature);
            }
            pool.remove(index);
            pool.push(replacement.clone());
            Ok(replacement)
        })?;
        info!("{} edited a pending transaction", username);
        Ok(replacement)
    }

    pub fn cancel(&self, username: &str, original: &Transaction) -> Result<()> {
        let sender = self.directory.public_key_of(username)?;
        self.pool.slot.update(|pool| {
            let index = pool
                .iter()
                .position(|tx| {
                    tx.matches(original.amount(), &sender, original.receiver(), original.fee)
                })
                .ok_or(Error::TransactionNotFound)?;
            pool.remove(index);
            Ok(())
        })?;
        info!("{} cancelled a pending transaction", username);
        Ok(())
    }

    fn check(&self, username: &str, receiver: &str, amount: u64, fee: u64, balance: i128) -> Result<()> {
        if receiver == username {
            return Err(Error::SelfTransfer);
        }
        if amount == 0 || fee == 0 {
            return Err(Error::InvalidAmount);
        }
        let required = amount.checked_add(fee).ok_or(Error::InvalidAmount)?;
        if balance < i128::from(required) {
            return Err(Error::InsufficientBalance { balance, required });
        }
        validate_username(receiver)?;
        if !self.directory.username_exists(receiver)? {
            return Err(Error::UnknownUser(receiver.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Accounts;
    use crate::storage::SledStore;
    use crate::wallet::Wallet;

    struct Fixture {
        accounts: Accounts,
        pool: TransactionPool,
        ledger: Ledger,
        payments: Payments,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let accounts = Accounts::new(Arc::clone(&store));
        let pool = TransactionPool::new(Arc::clone(&store));
        let ledger = Ledger::new(store);
        let payments = Payments::new(
            pool.clone(),
            ledger.clone(),
            Arc::new(accounts.clone()),
            Arc::new(accounts.clone()),
        );
        Fixture {
            accounts,
            pool,
            ledger,
            payments,
        }
    }

    fn funded(f: &Fixture, name: &str, coins: u64) -> Wallet {
        let (_, wallet) = f.accounts.register(name).unwrap();
        f.ledger
            .settle(&[Transaction::new_reward(&wallet, coins).unwrap()])
            .unwrap();
        wallet
    }

    #[test]
    fn transfer_enters_pool() {
        let f = fixture();
        let alice = funded(&f, "alice", 50);
        let bob = funded(&f, "bob", 0);
        let tx = f.payments.transfer("alice", " Bob", 10, 2).unwrap();
        assert_eq!(tx.sender(), Some(&alice.identity()));
        assert_eq!(tx.receiver(), &bob.identity());
        assert_eq!(f.pool.transactions().unwrap(), vec![tx]);
    }

    #[test]
    fn transfer_policy_rejections_leave_pool_untouched() {
        let f = fixture();
        funded(&f, "alice", 10);
        funded(&f, "bob", 0);
        let p = &f.payments;
        assert!(matches!(p.transfer("alice", "alice", 1, 1), Err(Error::SelfTransfer)));
        assert!(matches!(p.transfer("alice", "bob", 0, 1), Err(Error::InvalidAmount)));
        assert!(matches!(p.transfer("alice", "bob", 1, 0), Err(Error::InvalidAmount)));
        assert!(matches!(
            p.transfer("alice", "bob", 10, 1),
            Err(Error::InsufficientBalance { balance: 10, required: 11 })
        ));
        assert!(matches!(p.transfer("alice", "b!", 1, 1), Err(Error::InvalidUsername(_))));
        assert!(matches!(p.transfer("alice", "carol", 1, 1), Err(Error::UnknownUser(_))));
        assert!(f.pool.transactions().unwrap().is_empty());
    }

    #[test]
    fn queued_coins_cannot_be_spent_twice() {
        let f = fixture();
        funded(&f, "alice", 10);
        funded(&f, "bob", 0);
        f.payments.transfer("alice", "bob", 9, 1).unwrap();
        assert!(matches!(
            f.payments.transfer("alice", "bob", 9, 1),
            Err(Error::InsufficientBalance { balance: 0, required: 10 })
        ));
        assert_eq!(f.pool.transactions().unwrap().len(), 1);
    }

    #[test]
    fn edit_may_reuse_the_coins_of_the_edited_transfer() {
        let f = fixture();
        funded(&f, "alice", 10);
        funded(&f, "bob", 0);
        let tx = f.payments.transfer("alice", "bob", 5, 1).unwrap();
        let all_in = f.payments.edit("alice", &tx, Edit::Amount(9)).unwrap();
        assert_eq!(f.pool.transactions().unwrap(), vec![all_in.clone()]);
        assert!(matches!(
            f.payments.edit("alice", &all_in, Edit::Amount(10)),
            Err(Error::InsufficientBalance { balance: 10, required: 11 })
        ));
    }

    #[test]
    fn edit_replaces_in_place() {
        let f = fixture();
        funded(&f, "alice", 50);
        funded(&f, "bob", 0);
        let carol = funded(&f, "carol", 0);
        let tx = f.payments.transfer("alice", "bob", 10, 2).unwrap();

        let moved = f
            .payments
            .edit("alice", &tx, Edit::Receiver("carol".into()))
            .unwrap();
        assert_eq!(moved.receiver(), &carol.identity());
        let pricier = f.payments.edit("alice", &moved, Edit::Fee(5)).unwrap();
        let bigger = f.payments.edit("alice", &pricier, Edit::Amount(20)).unwrap();
        assert_eq!((bigger.amount(), bigger.fee), (20, 5));
        assert!(bigger.verify());
        assert_eq!(f.pool.transactions().unwrap(), vec![bigger]);
    }

    #[test]
    fn failed_edit_changes_nothing() {
        let f = fixture();
        funded(&f, "alice", 50);
        funded(&f, "bob", 0);
        let tx = f.payments.transfer("alice", "bob", 10, 2).unwrap();
        assert!(matches!(
            f.payments.edit("alice", &tx, Edit::Amount(100)),
            Err(Error::InsufficientBalance { .. })
        ));
        assert!(matches!(
            f.payments.edit("alice", &tx, Edit::Receiver("nobody".into())),
            Err(Error::UnknownUser(_))
        ));
        assert!(matches!(
            f.payments.edit("bob", &tx, Edit::Fee(1)),
            Err(Error::TransactionNotFound)
        ));
        assert_eq!(f.pool.transactions().unwrap(), vec![tx]);
    }

    #[test]
    fn edit_of_vanished_transaction_is_not_found() {
        let f = fixture();
        funded(&f, "alice", 50);
        funded(&f, "bob", 0);
        let tx = f.payments.transfer("alice", "bob", 10, 2).unwrap();
        f.pool.remove_transaction(&tx).unwrap();
        assert!(matches!(
            f.payments.edit("alice", &tx, Edit::Fee(3)),
            Err(Error::TransactionNotFound)
        ));
        assert!(f.pool.transactions().unwrap().is_empty());
    }

    #[test]
    fn cancel_removes_own_transaction_only() {
        let f = fixture();
        funded(&f, "alice", 50);
        funded(&f, "bob", 0);
        let tx = f.payments.transfer("alice", "bob", 10, 2).unwrap();
        assert!(matches!(f.payments.cancel("bob", &tx), Err(Error::TransactionNotFound)));
        f.payments.cancel("alice", &tx).unwrap();
        assert!(f.pool.transactions().unwrap().is_empty());
    }

    #[test]
    fn take_valid_skips_and_keeps_bad_ones() {
        let f = fixture();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let good = Transaction::new_transfer(&alice, bob.identity(), 1, 1).unwrap();
        let mut bad = Transaction::new_transfer(&alice, bob.identity(), 2, 1).unwrap();
        bad.signature.clear();
        f.pool.add_transactions(&[bad.clone(), good.clone(), good.clone()]).unwrap();
        assert_eq!(f.pool.take_valid(1).unwrap(), vec![good.clone()]);
        assert_eq!(f.pool.transactions().unwrap(), vec![bad.clone(), good]);

        assert_eq!(f.pool.cancel_invalid(&alice.identity()).unwrap(), 1);
        assert_eq!(f.pool.user_transactions(&alice.identity()).unwrap().len(), 1);
    }
}
