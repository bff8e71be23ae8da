use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::tx::{TxInput, TxKind, TxOutput};
use crate::wallet::{self, Identity, Wallet};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub kind: TxKind,
    // absent for rewards
    pub input: Option<TxInput>,
    pub output: TxOutput,
    pub fee: u64,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Builds and signs a transfer of `amount` from the wallet owner to
    /// `receiver`. Policy checks live in the pool, not here.
    pub fn new_transfer(from: &Wallet, receiver: Identity, amount: u64, fee: u64) -> Result<Transaction> {
        let mut tx = Transaction {
            kind: TxKind::Normal,
            input: Some(TxInput::new(from.identity(), amount)),
            output: TxOutput::new(receiver, amount),
            fee,
            signature: Vec::new(),
        };
        tx.sign(from)?;
        Ok(tx)
    }

    /// Moves a settled block's fee from its sender to the block's proposer.
    pub fn new_fee_transfer(sender: &Wallet, miner: Identity, fee: u64) -> Result<Transaction> {
        Transaction::new_transfer(sender, miner, fee, 0)
    }

    /// A reward carries no input; it is signed by its recipient.
    pub fn new_reward(to: &Wallet, amount: u64) -> Result<Transaction> {
        info!("new reward transaction to: {}", to.identity());
        let mut tx = Transaction {
            kind: TxKind::Reward,
            input: None,
            output: TxOutput::new(to.identity(), amount),
            fee: 0,
            signature: Vec::new(),
        };
        tx.sign(to)?;
        Ok(tx)
    }

    pub fn is_reward(&self) -> bool {
        self.kind == TxKind::Reward
    }

    pub fn sender(&self) -> Option<&Identity> {
        self.input.as_ref().map(|i| &i.identity)
    }

    pub fn receiver(&self) -> &Identity {
        &self.output.identity
    }

    pub fn amount(&self) -> u64 {
        self.output.amount
    }

    /// Hex digest of everything except the signature.
    pub fn hash(&self) -> Result<String> {
        let content = (self.kind, &self.input, &self.output, self.fee);
        let data = bincode::serialize(&content)?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn sign(&mut self, wallet: &Wallet) -> Result<()> {
        let digest = self.hash()?;
        self.signature = wallet.sign(digest.as_bytes());
        Ok(())
    }

    /// The identity whose key must have produced the signature.
    fn signer(&self) -> Option<&Identity> {
        match self.kind {
            TxKind::Normal => self.sender(),
            TxKind::Reward => Some(self.receiver()),
        }
    }

    pub fn verify(&self) -> bool {
        let well_formed = match self.kind {
            TxKind::Normal => self
                .input
                .as_ref()
                .map_or(false, |i| i.amount == self.output.amount),
            TxKind::Reward => self.input.is_none() && self.fee == 0,
        };
        if !well_formed || self.signature.is_empty() {
            return false;
        }
        let signer = match self.signer() {
            Some(s) => s,
            None => return false,
        };
        match self.hash() {
            Ok(digest) => wallet::verify(digest.as_bytes(), &self.signature, signer),
            Err(_) => false,
        }
    }

    /// Pool lookup key used by edit and cancel.
    pub fn matches(&self, amount: u64, sender: &Identity, receiver: &Identity, fee: u64) -> bool {
        self.input
            .as_ref()
            .map_or(false, |i| i.amount == amount && &i.identity == sender)
            && self.output.is_to(receiver)
            && self.fee == fee
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            Some(input) => write!(
                f,
                "{} -> {}: {} coin(s), fee {}",
                input.identity, self.output.identity, self.output.amount, self.fee
            ),
            None => write!(f, "reward -> {}: {} coin(s)", self.output.identity, self.output.amount),
        }
    }
}
