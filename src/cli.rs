use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{arg, ArgMatches, Command};
use log::info;
use tokio::net::TcpListener;

use crate::accounts::{Accounts, Directory, KeyRing};
use crate::balance::balance;
use crate::block::{Block, StructuralCheck};
use crate::blockchain::Ledger;
use crate::client::{send_to_miner_servers, send_to_wallet_servers};
use crate::config::Config;
use crate::consensus::{ConsensusEngine, Outcome};
use crate::constants::REGISTRATION_REWARD;
use crate::message::{MinerCommand, NewUser, WalletCommand};
use crate::miner::Miner;
use crate::notification::{Notifications, Notifier, Relay};
use crate::pool::{Edit, Payments, TransactionPool};
use crate::server::{Handler, MinerHandler, Server, WalletHandler};
use crate::storage::{SledStore, Store};
use crate::transaction::Transaction;

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

pub struct Cli {}

impl Cli {
    pub fn new() -> Cli {
        Cli {}
    }

    pub async fn run(&mut self) -> CliResult<()> {
        let matches = Command::new("goodchain")
            .version("0.1")
            .about("a linear chain with reviewer voting")
            .arg(arg!(-c --config <FILE> "node configuration (JSON)").required(false))
            .subcommand(Command::new("create").about("create the blockchain with its genesis block"))
            .subcommand(
                Command::new("register")
                    .about("register a user and grant the sign-up reward")
                    .arg(arg!(<USERNAME> "name of the new user")),
            )
            .subcommand(
                Command::new("send")
                    .about("put a transfer into the pool")
                    .arg(arg!(<FROM> "sending user"))
                    .arg(arg!(<TO> "receiving user"))
                    .arg(arg!(<AMOUNT> "coins to send"))
                    .arg(arg!(<FEE> "fee for the miner")),
            )
            .subcommand(
                Command::new("edit")
                    .about("change one of your pending transfers")
                    .arg(arg!(<USERNAME> "owner of the transfer"))
                    .arg(arg!(<INDEX> "position among the owner's pending transfers"))
                    .arg(arg!(--to <RECEIVER> "new receiver").required(false))
                    .arg(arg!(--amount <AMOUNT> "new amount").required(false))
                    .arg(arg!(--fee <FEE> "new fee").required(false)),
            )
            .subcommand(
                Command::new("cancel")
                    .about("withdraw one of your pending transfers")
                    .arg(arg!(<USERNAME> "owner of the transfer"))
                    .arg(arg!(<INDEX> "position among the owner's pending transfers")),
            )
            .subcommand(
                Command::new("mine")
                    .about("assemble pooled transfers into a pending block")
                    .arg(arg!(<USERNAME> "miner receiving the block reward")),
            )
            .subcommand(
                Command::new("check")
                    .about("vote on the pending block and tidy your pooled transfers")
                    .arg(arg!(<USERNAME> "active user")),
            )
            .subcommand(
                Command::new("balance")
                    .about("settled balance of a user")
                    .arg(arg!(<USERNAME> "user to look up")),
            )
            .subcommand(Command::new("pool").about("list pending transfers"))
            .subcommand(Command::new("printchain").about("print all blocks in the chain"))
            .subcommand(
                Command::new("notifications")
                    .about("show and clear a user's notifications")
                    .arg(arg!(<USERNAME> "inbox owner")),
            )
            .subcommand(
                Command::new("startnode")
                    .about("start a wallet or miner server")
                    .arg(arg!(<ROLE> "wallet or miner")),
            )
            .get_matches();

        let config_path = matches.get_one::<String>("config").map(PathBuf::from);
        let config = Config::load_or_default(config_path.as_deref())?;
        let node = Node::open(config)?;

        match matches.subcommand() {
            Some(("create", _)) => node.cmd_create(),
            Some(("register", m)) => node.cmd_register(required(m, "USERNAME")).await,
            Some(("send", m)) => {
                let amount = required(m, "AMOUNT").parse()?;
                let fee = required(m, "FEE").parse()?;
                node.cmd_send(required(m, "FROM"), required(m, "TO"), amount, fee)
                    .await
            }
            Some(("edit", m)) => {
                let edit = if let Some(to) = m.get_one::<String>("to") {
                    Edit::Receiver(to.clone())
                } else if let Some(amount) = m.get_one::<String>("amount") {
                    Edit::Amount(amount.parse()?)
                } else if let Some(fee) = m.get_one::<String>("fee") {
                    Edit::Fee(fee.parse()?)
                } else {
                    println!("nothing to edit: give --to, --amount or --fee");
                    exit(1)
                };
                let index = required(m, "INDEX").parse()?;
                node.cmd_edit(required(m, "USERNAME"), index, edit).await
            }
            Some(("cancel", m)) => {
                let index = required(m, "INDEX").parse()?;
                node.cmd_cancel(required(m, "USERNAME"), index).await
            }
            Some(("mine", m)) => node.cmd_mine(required(m, "USERNAME")).await,
            Some(("check", m)) => node.cmd_check(required(m, "USERNAME")).await,
            Some(("balance", m)) => node.cmd_balance(required(m, "USERNAME")),
            Some(("pool", _)) => node.cmd_pool(),
            Some(("printchain", _)) => node.cmd_print_chain(),
            Some(("notifications", m)) => node.cmd_notifications(required(m, "USERNAME")),
            Some(("startnode", m)) => node.cmd_start_node(required(m, "ROLE")).await,
            _ => {
                println!("no command given, see --help");
                Ok(())
            }
        }
    }
}

impl Default for Cli {
    fn default() -> Self {
        Cli::new()
    }
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> &'a str {
    match matches.get_one::<String>(id) {
        Some(v) => v.as_str(),
        None => {
            println!("{} not supplied, see --help", id);
            exit(1)
        }
    }
}

/// Everything one CLI invocation works on, backed by the local store.
struct Node {
    config: Config,
    accounts: Accounts,
    ledger: Ledger,
    pool: TransactionPool,
    notifications: Notifications,
}

impl Node {
    fn open(config: Config) -> CliResult<Node> {
        let store: Arc<dyn Store> = Arc::new(SledStore::open(&config.data_dir)?);
        let accounts = Accounts::new(Arc::clone(&store));
        Ok(Node {
            notifications: Notifications::new(Arc::clone(&store), Arc::new(accounts.clone())),
            ledger: Ledger::new(Arc::clone(&store)),
            pool: TransactionPool::new(store),
            accounts,
            config,
        })
    }

    fn payments(&self) -> Payments {
        Payments::new(
            self.pool.clone(),
            self.ledger.clone(),
            Arc::new(self.accounts.clone()),
            Arc::new(self.accounts.clone()),
        )
    }

    /// The pending transfer at `index` among the ones `username` sent.
    fn pending_of(&self, username: &str, index: usize) -> CliResult<Transaction> {
        let identity = self.accounts.public_key_of(username)?;
        match self.pool.user_transactions(&identity)?.into_iter().nth(index) {
            Some(tx) => Ok(tx),
            None => {
                println!("{} has no pending transaction #{}", username, index);
                exit(1)
            }
        }
    }

    async fn to_miners(&self, commands: &[MinerCommand]) {
        if !self.config.miner_peers.is_empty() {
            send_to_miner_servers(&self.config.miner_peers, commands).await;
        }
    }

    async fn to_wallets(&self, commands: &[WalletCommand]) {
        if !self.config.wallet_peers.is_empty() {
            send_to_wallet_servers(&self.config.wallet_peers, commands).await;
        }
    }

    fn cmd_create(&self) -> CliResult<()> {
        let genesis = self.ledger.create_blockchain()?;
        println!("created blockchain, genesis hash {}", genesis.get_hash());
        Ok(())
    }

    async fn cmd_register(&self, username: &str) -> CliResult<()> {
        let (record, wallet) = self.accounts.register(username)?;
        let reward = Transaction::new_reward(&wallet, REGISTRATION_REWARD)?;
        self.pool.add_transaction(reward.clone())?;

        let key_material = self.accounts.key_material()?.unwrap_or_default();
        self.to_wallets(&[WalletCommand::NewUser(NewUser {
            username: record.username.clone(),
            password_hash: record.password_hash,
            private_key: record.private_key,
            public_key: record.public_key.clone(),
            phrase_hash: record.phrase_hash,
            key_material,
        })])
        .await;
        self.to_miners(&[MinerCommand::AddTransaction(reward)]).await;
        println!("registered {} with key {}", record.username, record.public_key);
        Ok(())
    }

    async fn cmd_send(&self, from: &str, to: &str, amount: u64, fee: u64) -> CliResult<()> {
        let tx = self.payments().transfer(from, to, amount, fee)?;
        self.to_miners(&[MinerCommand::AddTransaction(tx.clone())]).await;
        println!("added to pool: {}", tx);
        Ok(())
    }

    async fn cmd_edit(&self, username: &str, index: usize, edit: Edit) -> CliResult<()> {
        let original = self.pending_of(username, index)?;
        let replacement = self.payments().edit(username, &original, edit)?;
        self.to_miners(&[
            MinerCommand::RemoveTransaction(original),
            MinerCommand::AddTransaction(replacement.clone()),
        ])
        .await;
        println!("replaced with: {}", replacement);
        Ok(())
    }

    async fn cmd_cancel(&self, username: &str, index: usize) -> CliResult<()> {
        let original = self.pending_of(username, index)?;
        self.payments().cancel(username, &original)?;
        self.to_miners(&[MinerCommand::RemoveTransaction(original)]).await;
        println!("transaction cancelled");
        Ok(())
    }

    async fn cmd_mine(&self, username: &str) -> CliResult<()> {
        let wallet = self.accounts.wallet_of(username)?;
        let block = Miner::new(self.ledger.clone(), self.pool.clone()).mine_block(&wallet)?;
        let txs = block.get_transaction();
        let mined = txs[..txs.len().saturating_sub(1)].to_vec();
        self.to_miners(&[
            MinerCommand::AddBlock(block.clone()),
            MinerCommand::RemoveTransactionList(mined),
        ])
        .await;
        println!("mined block {} with hash {}, waiting for validators", block.id(), block.get_hash());
        Ok(())
    }

    async fn cmd_check(&self, username: &str) -> CliResult<()> {
        let relay = Arc::new(Relay::new(self.notifications.clone()));
        let notifier: Arc<dyn Notifier> = relay.clone();
        let engine = ConsensusEngine::new(
            self.ledger.clone(),
            self.pool.clone(),
            Arc::new(self.accounts.clone()),
            Arc::new(self.accounts.clone()),
            notifier,
            Arc::new(StructuralCheck),
        );

        let before = self.pool.transactions()?;
        let outcome = engine.tick(username)?;
        let after = self.pool.transactions()?;

        match &outcome {
            Outcome::Idle | Outcome::Ineligible => {}
            Outcome::Voted(vote) => println!("recorded vote {:?}", vote),
            Outcome::Committed(block) => println!("block {} verified", block.id()),
            Outcome::Rejected(block) => println!("block {} rejected", block.id()),
        }
        let commands = check_commands(&outcome, &self.ledger.blocks()?, &before, &after);

        self.to_miners(&commands).await;
        self.to_wallets(&relay.drain()).await;
        Ok(())
    }

    fn cmd_balance(&self, username: &str) -> CliResult<()> {
        let identity = self.accounts.public_key_of(username)?;
        let history = self.ledger.history()?;
        println!("Balance of '{}': {}", username, balance(&identity, &history));
        Ok(())
    }

    fn cmd_pool(&self) -> CliResult<()> {
        let txs = self.pool.transactions()?;
        println!("{} pending transaction(s)", txs.len());
        for tx in txs {
            println!("{}", tx);
        }
        Ok(())
    }

    fn cmd_print_chain(&self) -> CliResult<()> {
        for b in self.ledger.blocks()? {
            println!("{:#?}", b);
        }
        Ok(())
    }

    fn cmd_notifications(&self, username: &str) -> CliResult<()> {
        let inbox = self.notifications.for_user(username)?;
        if inbox.is_empty() {
            println!("no notifications");
        }
        for message in inbox {
            println!("{}", message);
        }
        self.notifications.clear(username)?;
        Ok(())
    }

    async fn cmd_start_node(self, role: &str) -> CliResult<()> {
        match role {
            "wallet" => {
                let handler = WalletHandler::new(
                    self.accounts.clone(),
                    Arc::new(self.notifications.clone()),
                );
                serve(handler, &self.config, &self.config.wallet_listen).await
            }
            "miner" => {
                let handler = MinerHandler::new(self.ledger.clone(), self.pool.clone());
                serve(handler, &self.config, &self.config.miner_listen).await
            }
            other => {
                println!("unknown role {}, expected wallet or miner", other);
                exit(1)
            }
        }
    }
}

async fn serve<H: Handler>(handler: H, config: &Config, addr: &str) -> CliResult<()> {
    let (server, shutdown) = Server::new(handler, config);
    let listener = TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            shutdown.trigger();
        }
    });
    server.serve(listener).await?;
    Ok(())
}

/// What miner peers need to hear after a local activity check. `chain` is
/// the local chain as it stands after the check.
fn check_commands(
    outcome: &Outcome,
    chain: &[Block],
    pool_before: &[Transaction],
    pool_after: &[Transaction],
) -> Vec<MinerCommand> {
    let mut commands = Vec::new();
    match outcome {
        Outcome::Idle | Outcome::Ineligible => {}
        Outcome::Voted(_) => {
            if let Some(last) = chain.last() {
                commands.push(MinerCommand::BlockValidation(last.clone()));
            }
        }
        Outcome::Committed(block) => commands.push(MinerCommand::BlockValidation(block.clone())),
        // the rejected block sat right after what is now the last block
        Outcome::Rejected(_) => commands.push(MinerCommand::RemoveBlock(chain.len() as u64)),
    }
    commands.extend(pool_changes(pool_before, pool_after));
    commands
}

/// Pool edits made locally, as commands for the miner peers.
fn pool_changes(before: &[Transaction], after: &[Transaction]) -> Vec<MinerCommand> {
    let removed = before
        .iter()
        .filter(|tx| !after.contains(tx))
        .map(|tx| MinerCommand::RemoveTransaction(tx.clone()));
    let added = after
        .iter()
        .filter(|tx| !before.contains(tx))
        .map(|tx| MinerCommand::AddTransaction(tx.clone()));
    removed.chain(added).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStatus, Vote};
    use crate::wallet::Wallet;

    #[test]
    fn pool_changes_lists_removals_then_additions() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let kept = Transaction::new_transfer(&a, b.identity(), 1, 1).unwrap();
        let gone = Transaction::new_transfer(&a, b.identity(), 2, 1).unwrap();
        let fresh = Transaction::new_fee_transfer(&a, b.identity(), 1).unwrap();

        let changes = pool_changes(&[kept.clone(), gone.clone()], &[kept, fresh.clone()]);
        assert_eq!(
            changes,
            vec![
                MinerCommand::RemoveTransaction(gone),
                MinerCommand::AddTransaction(fresh),
            ]
        );
    }

    fn chain_with_pending(miner: &Wallet) -> Vec<Block> {
        let genesis = Block::new_genesis_block().unwrap();
        let reward = Transaction::new_reward(miner, 50).unwrap();
        let pending = Block::new_block(1, vec![reward], genesis.get_hash()).unwrap();
        vec![genesis, pending]
    }

    #[test]
    fn vote_propagates_the_last_block() {
        let m = Wallet::generate();
        let mut chain = chain_with_pending(&m);
        chain[1].validators.push(("alice".into(), Vote::Valid));
        let commands = check_commands(&Outcome::Voted(Vote::Valid), &chain, &[], &[]);
        assert_eq!(commands, vec![MinerCommand::BlockValidation(chain[1].clone())]);
        assert!(check_commands(&Outcome::Ineligible, &chain, &[], &[]).is_empty());
        assert!(check_commands(&Outcome::Idle, &chain, &[], &[]).is_empty());
    }

    #[test]
    fn commit_propagates_block_and_fee_transfers() {
        let m = Wallet::generate();
        let a = Wallet::generate();
        let mut chain = chain_with_pending(&m);
        chain[1].status = BlockStatus::Verified;
        let fee = Transaction::new_fee_transfer(&a, m.identity(), 1).unwrap();

        let commands = check_commands(
            &Outcome::Committed(chain[1].clone()),
            &chain,
            &[],
            &[fee.clone()],
        );
        assert_eq!(
            commands,
            vec![
                MinerCommand::BlockValidation(chain[1].clone()),
                MinerCommand::AddTransaction(fee),
            ]
        );
    }

    #[test]
    fn rejection_removes_the_block_at_its_old_index() {
        let m = Wallet::generate();
        let a = Wallet::generate();
        let mut chain = chain_with_pending(&m);
        let mut rejected = chain.pop().unwrap();
        rejected.status = BlockStatus::Rejected;
        let requeued = Transaction::new_transfer(&a, m.identity(), 3, 1).unwrap();

        let commands = check_commands(
            &Outcome::Rejected(rejected),
            &chain,
            &[],
            &[requeued.clone()],
        );
        assert_eq!(
            commands,
            vec![
                MinerCommand::RemoveBlock(1),
                MinerCommand::AddTransaction(requeued),
            ]
        );
    }

    #[test]
    fn unchanged_pool_sends_nothing() {
        let a = Wallet::generate();
        let tx = Transaction::new_reward(&a, 50).unwrap();
        assert!(pool_changes(&[tx.clone()], &[tx]).is_empty());
    }
}
