use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::accounts::Directory;
use crate::constants::NOTIFICATIONS_SLOT;
use crate::error::Result;
use crate::message::{AddNotification, AddNotificationToAllUsers, WalletCommand};
use crate::storage::{Slot, Store};

pub trait Notifier: Send + Sync {
    fn notify(&self, username: &str, message: &str) -> Result<()>;
    fn notify_all(&self, message: &str, exclude: Option<&str>) -> Result<()>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub username: String,
    pub message: String,
}

/// Per-user inbox kept in the local store.
#[derive(Clone)]
pub struct Notifications {
    slot: Slot<Notification>,
    directory: Arc<dyn Directory>,
}

impl Notifications {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Notifications {
        Notifications {
            slot: Slot::new(store, NOTIFICATIONS_SLOT),
            directory,
        }
    }

    pub fn for_user(&self, username: &str) -> Result<Vec<String>> {
        Ok(self
            .slot
            .load()?
            .into_iter()
            .filter(|n| n.username == username)
            .map(|n| n.message)
            .collect())
    }

    pub fn clear(&self, username: &str) -> Result<()> {
        self.slot.update(|all| {
            all.retain(|n| n.username != username);
            Ok(())
        })
    }
}

impl Notifier for Notifications {
    fn notify(&self, username: &str, message: &str) -> Result<()> {
        debug!("notify {}: {}", username, message);
        self.slot.update(|all| {
            all.push(Notification {
                username: username.to_string(),
                message: message.to_string(),
            });
            Ok(())
        })
    }

    fn notify_all(&self, message: &str, exclude: Option<&str>) -> Result<()> {
        let recipients: Vec<String> = self
            .directory
            .usernames()?
            .into_iter()
            .filter(|u| Some(u.as_str()) != exclude)
            .collect();
        debug!("notify {} user(s): {}", recipients.len(), message);
        self.slot.update(|all| {
            all.extend(recipients.iter().map(|u| Notification {
                username: u.clone(),
                message: message.to_string(),
            }));
            Ok(())
        })
    }
}

/// Delivers locally and remembers every notification as a wallet command,
/// so the caller can forward them to its peers afterwards.
pub struct Relay<N> {
    inner: N,
    outbox: Mutex<Vec<WalletCommand>>,
}

impl<N: Notifier> Relay<N> {
    pub fn new(inner: N) -> Relay<N> {
        Relay {
            inner,
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn drain(&self) -> Vec<WalletCommand> {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *outbox)
    }

    fn push(&self, command: WalletCommand) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);
    }
}

impl<N: Notifier> Notifier for Relay<N> {
    fn notify(&self, username: &str, message: &str) -> Result<()> {
        self.inner.notify(username, message)?;
        self.push(WalletCommand::AddNotification(AddNotification {
            username: username.to_string(),
            message: message.to_string(),
        }));
        Ok(())
    }

    fn notify_all(&self, message: &str, exclude: Option<&str>) -> Result<()> {
        self.inner.notify_all(message, exclude)?;
        self.push(WalletCommand::AddNotificationToAllUsers(AddNotificationToAllUsers {
            message: message.to_string(),
            exclude_username: exclude.map(str::to_string),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Accounts;
    use crate::message::Command;
    use crate::storage::SledStore;

    fn setup() -> (Accounts, Notifications) {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let accounts = Accounts::new(Arc::clone(&store));
        let notes = Notifications::new(store, Arc::new(accounts.clone()));
        (accounts, notes)
    }

    #[test]
    fn notify_all_skips_excluded() {
        let (accounts, notes) = setup();
        accounts.register("alice").unwrap();
        accounts.register("bob").unwrap();
        accounts.register("miner").unwrap();
        notes.notify_all("block 1 verified", Some("miner")).unwrap();
        notes.notify("miner", "your block is verified").unwrap();
        assert_eq!(notes.for_user("alice").unwrap(), vec!["block 1 verified"]);
        assert_eq!(notes.for_user("bob").unwrap(), vec!["block 1 verified"]);
        assert_eq!(notes.for_user("miner").unwrap(), vec!["your block is verified"]);
        notes.clear("alice").unwrap();
        assert!(notes.for_user("alice").unwrap().is_empty());
    }

    #[test]
    fn relay_records_outgoing_commands() {
        let (accounts, notes) = setup();
        accounts.register("alice").unwrap();
        let relay = Relay::new(notes.clone());
        relay.notify("alice", "hello").unwrap();
        relay.notify_all("to everyone", None).unwrap();
        let sent = relay.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].tag(), "add_notification");
        assert_eq!(sent[1].tag(), "add_notification_to_all_users");
        assert!(relay.drain().is_empty());
        assert_eq!(notes.for_user("alice").unwrap(), vec!["hello", "to everyone"]);
    }
}
