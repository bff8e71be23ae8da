pub mod accounts;
pub mod balance;
pub mod block;
pub mod blockchain;
pub mod cli;
pub mod client;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod message;
pub mod miner;
pub mod notification;
pub mod pool;
pub mod server;
pub mod storage;
pub mod transaction;
pub mod tx;
pub mod wallet;
