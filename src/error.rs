use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot send coins to yourself")]
    SelfTransfer,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("insufficient balance: {balance} available, {required} required")]
    InsufficientBalance { balance: i128, required: u64 },
    #[error("invalid username: {0}")]
    InvalidUsername(String),
    #[error("user does not exist: {0}")]
    UnknownUser(String),
    #[error("username is already taken: {0}")]
    DuplicateUsername(String),
    #[error("transaction not found in the pool")]
    TransactionNotFound,
    #[error("transaction signature does not verify")]
    InvalidSignature,
    #[error("last block is still pending")]
    BlockPending,
    #[error("not enough valid transactions to mine a block")]
    EmptyBlock,
    #[error("no blockchain found, create one first")]
    NoChain,
    #[error("block {0} does not extend the last block")]
    Unlinked(u64),
    #[error("block {0} is not the last block")]
    NotLastBlock(u64),
    #[error("blockchain already exists")]
    ChainExists,
    #[error("key error: {0}")]
    Key(String),
    #[error("malformed message: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Key(e.to_string())
    }
}
