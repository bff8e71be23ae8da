use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::wallet::Identity;

/// What travels over the socket: one tag plus its bincode-encoded
/// arguments. No version field, no acknowledgment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: String,
    pub payload: Vec<u8>,
}

/// Outcome of decoding one received message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<C> {
    Command(C),
    Unrecognized(String),
}

/// A closed vocabulary of commands for one server role.
pub trait Command: Sized + Send + 'static {
    const ROLE: &'static str;

    fn tag(&self) -> &'static str;

    fn encode_payload(&self) -> Result<Vec<u8>>;

    /// `Ok(None)` when `tag` is not part of this vocabulary.
    fn decode(tag: &str, payload: &[u8]) -> Result<Option<Self>>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            tag: self.tag().to_string(),
            payload: self.encode_payload()?,
        };
        Ok(bincode::serialize(&envelope)?)
    }
}

/// Decodes a single read. A truncated or garbled message is an error; a
/// well-formed envelope with a foreign tag is `Unrecognized`.
pub fn decode_message<C: Command>(bytes: &[u8]) -> Result<Decoded<C>> {
    let envelope: Envelope = bounded(bytes)?;
    match C::decode(&envelope.tag, &envelope.payload)? {
        Some(command) => Ok(Decoded::Command(command)),
        None => Ok(Decoded::Unrecognized(envelope.tag)),
    }
}

// Length prefixes can never claim more than the bytes we actually hold.
fn bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
        .map_err(|e| Error::Decode(e.to_string()))
}

/************************ wallet role ************************/

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub password_hash: Vec<u8>,
    pub private_key: Vec<u8>,
    pub public_key: Identity,
    pub phrase_hash: Vec<u8>,
    pub key_material: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdatePassword {
    pub username: String,
    pub password_hash: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateUsername {
    pub username: String,
    pub new_username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddNotification {
    pub username: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddNotificationToAllUsers {
    pub message: String,
    pub exclude_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletCommand {
    NewUser(NewUser),
    UpdatePassword(UpdatePassword),
    UpdateUsername(UpdateUsername),
    AddNotification(AddNotification),
    AddNotificationToAllUsers(AddNotificationToAllUsers),
}

impl Command for WalletCommand {
    const ROLE: &'static str = "wallet";

    fn tag(&self) -> &'static str {
        match self {
            WalletCommand::NewUser(_) => "new_user",
            WalletCommand::UpdatePassword(_) => "update_password",
            WalletCommand::UpdateUsername(_) => "update_username",
            WalletCommand::AddNotification(_) => "add_notification",
            WalletCommand::AddNotificationToAllUsers(_) => "add_notification_to_all_users",
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            WalletCommand::NewUser(m) => bincode::serialize(m)?,
            WalletCommand::UpdatePassword(m) => bincode::serialize(m)?,
            WalletCommand::UpdateUsername(m) => bincode::serialize(m)?,
            WalletCommand::AddNotification(m) => bincode::serialize(m)?,
            WalletCommand::AddNotificationToAllUsers(m) => bincode::serialize(m)?,
        };
        Ok(bytes)
    }

    fn decode(tag: &str, payload: &[u8]) -> Result<Option<Self>> {
        let command = match tag {
            "new_user" => WalletCommand::NewUser(bounded(payload)?),
            "update_password" => WalletCommand::UpdatePassword(bounded(payload)?),
            "update_username" => WalletCommand::UpdateUsername(bounded(payload)?),
            "add_notification" => WalletCommand::AddNotification(bounded(payload)?),
            "add_notification_to_all_users" => {
                WalletCommand::AddNotificationToAllUsers(bounded(payload)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/************************ miner role ************************/

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerCommand {
    AddBlock(Block),
    AddTransaction(Transaction),
    RemoveTransaction(Transaction),
    // the last block with its updated votes and status
    BlockValidation(Block),
    RemoveBlock(u64),
    RemoveTransactionList(Vec<Transaction>),
}

impl Command for MinerCommand {
    const ROLE: &'static str = "miner";

    fn tag(&self) -> &'static str {
        match self {
            MinerCommand::AddBlock(_) => "add_block",
            MinerCommand::AddTransaction(_) => "add_transaction",
            MinerCommand::RemoveTransaction(_) => "remove_transaction",
            MinerCommand::BlockValidation(_) => "block_validation",
            MinerCommand::RemoveBlock(_) => "remove_block",
            MinerCommand::RemoveTransactionList(_) => "remove_transaction_list",
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            MinerCommand::AddBlock(b) | MinerCommand::BlockValidation(b) => bincode::serialize(b)?,
            MinerCommand::AddTransaction(tx) | MinerCommand::RemoveTransaction(tx) => {
                bincode::serialize(tx)?
            }
            MinerCommand::RemoveBlock(index) => bincode::serialize(index)?,
            MinerCommand::RemoveTransactionList(txs) => bincode::serialize(txs)?,
        };
        Ok(bytes)
    }

    fn decode(tag: &str, payload: &[u8]) -> Result<Option<Self>> {
        let command = match tag {
            "add_block" => MinerCommand::AddBlock(bounded(payload)?),
            "add_transaction" => MinerCommand::AddTransaction(bounded(payload)?),
            "remove_transaction" => MinerCommand::RemoveTransaction(bounded(payload)?),
            "block_validation" => MinerCommand::BlockValidation(bounded(payload)?),
            "remove_block" => MinerCommand::RemoveBlock(bounded(payload)?),
            "remove_transaction_list" => MinerCommand::RemoveTransactionList(bounded(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn wallet_command_survives_the_wire() {
        let cmd = WalletCommand::AddNotificationToAllUsers(AddNotificationToAllUsers {
            message: "block 3 verified".into(),
            exclude_username: Some("miner".into()),
        });
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(decode_message::<WalletCommand>(&bytes).unwrap(), Decoded::Command(cmd));
    }

    #[test]
    fn foreign_tag_is_unrecognized_not_an_error() {
        let tx = Transaction::new_reward(&Wallet::generate(), 5).unwrap();
        let bytes = MinerCommand::AddTransaction(tx).to_bytes().unwrap();
        assert_eq!(
            decode_message::<WalletCommand>(&bytes).unwrap(),
            Decoded::Unrecognized("add_transaction".to_string())
        );
    }

    #[test]
    fn truncated_message_fails_to_decode() {
        let cmd = WalletCommand::AddNotification(AddNotification {
            username: "alice".into(),
            message: "x".repeat(100),
        });
        let bytes = cmd.to_bytes().unwrap();
        let res = decode_message::<WalletCommand>(&bytes[..bytes.len() / 2]);
        assert!(matches!(res, Err(Error::Decode(_))));
        assert!(matches!(decode_message::<WalletCommand>(&[]), Err(Error::Decode(_))));
    }

    #[test]
    fn huge_length_prefix_is_rejected() {
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"new_user");
        assert!(matches!(decode_message::<WalletCommand>(&bytes), Err(Error::Decode(_))));
    }

    #[test]
    fn miner_vocabulary_tags() {
        let tx = Transaction::new_reward(&Wallet::generate(), 5).unwrap();
        let cmds = vec![
            MinerCommand::AddTransaction(tx.clone()),
            MinerCommand::RemoveTransaction(tx.clone()),
            MinerCommand::RemoveBlock(4),
            MinerCommand::RemoveTransactionList(vec![tx]),
        ];
        let tags: Vec<&str> = cmds.iter().map(|c| c.tag()).collect();
        assert_eq!(
            tags,
            vec!["add_transaction", "remove_transaction", "remove_block", "remove_transaction_list"]
        );
        for cmd in cmds {
            let bytes = cmd.to_bytes().unwrap();
            assert_eq!(decode_message::<MinerCommand>(&bytes).unwrap(), Decoded::Command(cmd));
        }
    }
}
