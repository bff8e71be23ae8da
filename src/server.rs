use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::accounts::{Accounts, UserRecord};
use crate::block::BlockStatus;
use crate::blockchain::Ledger;
use crate::config::Config;
use crate::error::Result;
use crate::message::{decode_message, Command, Decoded, MinerCommand, WalletCommand};
use crate::notification::Notifier;
use crate::pool::TransactionPool;

/// Applies the commands of one server role.
pub trait Handler: Send + Sync + 'static {
    type Command: Command;
    fn handle(&self, command: Self::Command) -> Result<()>;
}

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Applied(&'static str),
    Failed(&'static str),
    Unrecognized(String),
    Malformed,
    Empty,
}

/// Stops the accept loop of the server it was created with.
#[derive(Debug, Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl Shutdown {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

pub struct Server<H: Handler> {
    handler: Arc<H>,
    max_message_bytes: usize,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H, config: &Config) -> (Server<H>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        let server = Server {
            handler: Arc::new(handler),
            max_message_bytes: config.max_message_bytes,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            shutdown: rx,
        };
        (server, Shutdown(Arc::new(tx)))
    }

    /// Accepts until shut down. Every connection is handled on its own task;
    /// at most `max_connections` run at once. Tasks still running when the
    /// loop exits are left to finish on their own.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        info!(
            "{} server listening on {}",
            <H::Command as Command>::ROLE,
            listener.local_addr()?
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // a free slot first, so a saturated server still sees shutdown
            let permit = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {}", peer);
                        let handler = Arc::clone(&self.handler);
                        let max = self.max_message_bytes;
                        tokio::spawn(async move {
                            let delivery = handle_connection(stream, handler, max).await;
                            debug!("connection from {} done: {:?}", peer, delivery);
                            drop(permit);
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
        info!("{} server stopped", <H::Command as Command>::ROLE);
        Ok(())
    }
}

/// One bounded read, one decode, one command. Anything longer than
/// `max_message_bytes` is cut off and fails to decode.
pub async fn handle_connection<H: Handler>(mut stream: TcpStream, handler: Arc<H>, max_message_bytes: usize) -> Delivery {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut buf = vec![0u8; max_message_bytes];
    let n = match stream.read(&mut buf).await {
        Ok(0) => return Delivery::Empty,
        Ok(n) => n,
        Err(e) => {
            error!("error reading from {}: {}", peer, e);
            return Delivery::Malformed;
        }
    };
    match decode_message::<H::Command>(&buf[..n]) {
        Err(e) => {
            error!("error in data from {}: {}", peer, e);
            Delivery::Malformed
        }
        Ok(Decoded::Unrecognized(tag)) => {
            debug!("ignoring unknown command {} from {}", tag, peer);
            Delivery::Unrecognized(tag)
        }
        Ok(Decoded::Command(command)) => {
            let tag = command.tag();
            info!("receive {} from {}", tag, peer);
            match tokio::task::spawn_blocking(move || handler.handle(command)).await {
                Ok(Ok(())) => Delivery::Applied(tag),
                Ok(Err(e)) => {
                    error!("error handling {} from {}: {}", tag, peer, e);
                    Delivery::Failed(tag)
                }
                Err(e) => {
                    error!("handler for {} from {} panicked: {}", tag, peer, e);
                    Delivery::Failed(tag)
                }
            }
        }
    }
}

/// Keeps the local user table and inboxes in step with other wallets.
pub struct WalletHandler {
    accounts: Accounts,
    notifier: Arc<dyn Notifier>,
}

impl WalletHandler {
    pub fn new(accounts: Accounts, notifier: Arc<dyn Notifier>) -> WalletHandler {
        WalletHandler { accounts, notifier }
    }
}

impl Handler for WalletHandler {
    type Command = WalletCommand;

    fn handle(&self, command: WalletCommand) -> Result<()> {
        match command {
            WalletCommand::NewUser(m) => {
                // the key slot is only touched once the record is in
                self.accounts.insert_user(UserRecord {
                    username: m.username,
                    password_hash: m.password_hash,
                    private_key: m.private_key,
                    public_key: m.public_key,
                    phrase_hash: m.phrase_hash,
                })?;
                self.accounts.save_key_material(m.key_material)
            }
            WalletCommand::UpdatePassword(m) => {
                self.accounts.update_password(&m.username, m.password_hash)
            }
            WalletCommand::UpdateUsername(m) => {
                self.accounts.update_username(&m.username, &m.new_username)
            }
            WalletCommand::AddNotification(m) => self.notifier.notify(&m.username, &m.message),
            WalletCommand::AddNotificationToAllUsers(m) => {
                self.notifier.notify_all(&m.message, m.exclude_username.as_deref())
            }
        }
    }
}

/// Applies ledger and pool changes announced by other nodes.
pub struct MinerHandler {
    ledger: Ledger,
    pool: TransactionPool,
}

impl MinerHandler {
    pub fn new(ledger: Ledger, pool: TransactionPool) -> MinerHandler {
        MinerHandler { ledger, pool }
    }
}

impl Handler for MinerHandler {
    type Command = MinerCommand;

    fn handle(&self, command: MinerCommand) -> Result<()> {
        match command {
            MinerCommand::AddBlock(block) => self.ledger.add_block(block),
            MinerCommand::AddTransaction(tx) => self.pool.add_transaction(tx),
            MinerCommand::RemoveTransaction(tx) => {
                if !self.pool.remove_transaction(&tx)? {
                    debug!("transaction to remove was not pooled");
                }
                Ok(())
            }
            MinerCommand::BlockValidation(block) => {
                let settles = block.status == BlockStatus::Verified;
                let before = self.ledger.replace_last(block.clone())?;
                if settles && before == BlockStatus::Pending {
                    self.ledger.settle(block.get_transaction())?;
                }
                Ok(())
            }
            MinerCommand::RemoveBlock(index) => {
                let index = usize::try_from(index).unwrap_or(usize::MAX);
                if self.ledger.remove_block(index)?.is_none() {
                    debug!("no block at index {} to remove", index);
                }
                Ok(())
            }
            MinerCommand::RemoveTransactionList(txs) => {
                let removed = self.pool.remove_transactions(&txs)?;
                debug!("removed {} of {} transaction(s)", removed, txs.len());
                Ok(())
            }
        }
    }
}
