use log::{error, info};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::message::{Command, MinerCommand, WalletCommand};

/// Opens a connection, writes one command and closes. No reply is read.
pub async fn send_command<C: Command>(addr: &str, command: &C) -> Result<()> {
    let data = command.to_bytes()?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&data).await?;
    stream.shutdown().await?;
    info!("sent {} to {} ({} bytes)", command.tag(), addr, data.len());
    Ok(())
}

/// Sends `command` to every peer. Failures are logged and skipped; returns
/// how many peers took the message.
pub async fn broadcast<C: Command>(peers: &[String], command: &C) -> usize {
    let mut delivered = 0;
    for peer in peers {
        match send_command(peer, command).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("failed to send {} to {}: {}", command.tag(), peer, e),
        }
    }
    delivered
}

pub async fn send_to_wallet_servers(peers: &[String], commands: &[WalletCommand]) -> usize {
    let mut delivered = 0;
    for command in commands {
        delivered += broadcast(peers, command).await;
    }
    delivered
}

pub async fn send_to_miner_servers(peers: &[String], commands: &[MinerCommand]) -> usize {
    let mut delivered = 0;
    for command in commands {
        delivered += broadcast(peers, command).await;
    }
    delivered
}
