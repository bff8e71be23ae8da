use serde::{Deserialize, Serialize};

use crate::wallet::Identity;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Normal,
    Reward,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    // the account the funds are taken from
    pub identity: Identity,
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    // the account receiving the funds
    pub identity: Identity,
    pub amount: u64,
}

impl TxInput {
    pub fn new(identity: Identity, amount: u64) -> TxInput {
        TxInput { identity, amount }
    }

    pub fn is_from(&self, identity: &Identity) -> bool {
        &self.identity == identity
    }
}

impl TxOutput {
    pub fn new(identity: Identity, amount: u64) -> TxOutput {
        TxOutput { identity, amount }
    }

    pub fn is_to(&self, identity: &Identity) -> bool {
        &self.identity == identity
    }
}
