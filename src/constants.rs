// network
pub const WALLET_SERVER_ADDR: &str = "0.0.0.0:8000";
pub const MINER_SERVER_ADDR: &str = "0.0.0.0:9000";
/// Upper bound of the single read performed per connection.
pub const MAX_MESSAGE_BYTES: usize = 8888;
pub const MAX_CONNECTIONS: usize = 64;

// storage slots
pub const DATA_DIR: &str = "data/goodchain";
pub const CHAIN_SLOT: &str = "blockchain";
pub const HISTORY_SLOT: &str = "transactions";
pub const POOL_SLOT: &str = "pool";
pub const USERS_SLOT: &str = "users";
pub const NOTIFICATIONS_SLOT: &str = "notifications";
pub const KEY_SLOT: &str = "key";

// consensus
pub const QUORUM: usize = 3;

// mining
pub const MINING_REWARD: u64 = 50;
pub const REGISTRATION_REWARD: u64 = 50;
pub const MAX_BLOCK_TRANSACTIONS: usize = 10;
pub const MIN_BLOCK_TRANSACTIONS: usize = 1;

// users
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 32;
