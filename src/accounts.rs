use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::constants::{KEY_SLOT, MAX_USERNAME_LEN, MIN_USERNAME_LEN, USERS_SLOT};
use crate::error::{Error, Result};
use crate::storage::{Slot, Store};
use crate::wallet::{Identity, Wallet};

/// Username <-> public key lookups.
pub trait Directory: Send + Sync {
    fn public_key_of(&self, username: &str) -> Result<Identity>;
    fn username_of(&self, identity: &Identity) -> Result<String>;
    fn username_exists(&self, username: &str) -> Result<bool>;
    fn usernames(&self) -> Result<Vec<String>>;
}

/// Hands out the signing key of a user on demand.
pub trait KeyRing: Send + Sync {
    fn wallet_of(&self, username: &str) -> Result<Wallet>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: Vec<u8>,
    // opaque: protecting it at rest is the job of the login layer
    pub private_key: Vec<u8>,
    pub public_key: Identity,
    pub phrase_hash: Vec<u8>,
}

/// The local user table, one record per user.
#[derive(Clone)]
pub struct Accounts {
    users: Slot<UserRecord>,
    store: Arc<dyn Store>,
}

/// Lowercase and drop whitespace, the way usernames are typed in.
pub fn normalize_username(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

pub fn validate_username(username: &str) -> Result<()> {
    let len_ok = (MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&username.len());
    if len_ok && username.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(Error::InvalidUsername(username.to_string()))
    }
}

impl Accounts {
    pub fn new(store: Arc<dyn Store>) -> Accounts {
        Accounts {
            users: Slot::new(Arc::clone(&store), USERS_SLOT),
            store,
        }
    }

    /// Creates a key pair for a new user and stores the record.
    pub fn register(&self, username: &str) -> Result<(UserRecord, Wallet)> {
        let username = normalize_username(username);
        validate_username(&username)?;
        let wallet = Wallet::generate();
        let record = UserRecord {
            username,
            password_hash: Vec::new(),
            private_key: wallet.secret_bytes(),
            public_key: wallet.identity(),
            phrase_hash: Vec::new(),
        };
        self.insert_user(record.clone())?;
        Ok((record, wallet))
    }

    pub fn insert_user(&self, record: UserRecord) -> Result<()> {
        info!("insert user {}", record.username);
        self.users.update(|users| {
            if users.iter().any(|u| u.username == record.username) {
                return Err(Error::DuplicateUsername(record.username.clone()));
            }
            users.push(record.clone());
            Ok(())
        })
    }

    pub fn update_password(&self, username: &str, password_hash: Vec<u8>) -> Result<()> {
        self.users.update(|users| {
            let user = users
                .iter_mut()
                .find(|u| u.username == username)
                .ok_or_else(|| Error::UnknownUser(username.to_string()))?;
            user.password_hash = password_hash.clone();
            Ok(())
        })
    }

    pub fn update_username(&self, username: &str, new_username: &str) -> Result<()> {
        validate_username(new_username)?;
        self.users.update(|users| {
            if users.iter().any(|u| u.username == new_username) {
                return Err(Error::DuplicateUsername(new_username.to_string()));
            }
            let user = users
                .iter_mut()
                .find(|u| u.username == username)
                .ok_or_else(|| Error::UnknownUser(username.to_string()))?;
            user.username = new_username.to_string();
            Ok(())
        })
    }

    pub fn user(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.load()?.into_iter().find(|u| u.username == username))
    }

    pub fn save_key_material(&self, material: Vec<u8>) -> Result<()> {
        self.store.put(KEY_SLOT, material)
    }

    pub fn key_material(&self) -> Result<Option<Vec<u8>>> {
        self.store.get(KEY_SLOT)
    }
}

impl Directory for Accounts {
    fn public_key_of(&self, username: &str) -> Result<Identity> {
        self.user(username)?
            .map(|u| u.public_key)
            .ok_or_else(|| Error::UnknownUser(username.to_string()))
    }

    fn username_of(&self, identity: &Identity) -> Result<String> {
        self.users
            .load()?
            .into_iter()
            .find(|u| &u.public_key == identity)
            .map(|u| u.username)
            .ok_or_else(|| Error::UnknownUser(identity.to_string()))
    }

    fn username_exists(&self, username: &str) -> Result<bool> {
        Ok(self.user(username)?.is_some())
    }

    fn usernames(&self) -> Result<Vec<String>> {
        Ok(self.users.load()?.into_iter().map(|u| u.username).collect())
    }
}

impl KeyRing for Accounts {
    fn wallet_of(&self, username: &str) -> Result<Wallet> {
        let user = self
            .user(username)?
            .ok_or_else(|| Error::UnknownUser(username.to_string()))?;
        Wallet::from_secret(&user.private_key)
    }
}
