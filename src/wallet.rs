use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Public key of an account. Compared and stored as raw key bytes, shown
/// as hex.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Vec<u8>);

impl Identity {
    fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::Key(format!("public key must be 32 bytes, got {}", self.0.len())))?;
        Ok(VerifyingKey::from_bytes(&bytes)?)
    }
}

impl From<&VerifyingKey> for Identity {
    fn from(key: &VerifyingKey) -> Self {
        Identity(key.to_bytes().to_vec())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "Identity({})", &hex[..hex.len().min(16)])
    }
}

/// A signing key and the identity derived from it.
pub struct Wallet {
    signing_key: SigningKey,
}

impl Wallet {
    pub fn generate() -> Wallet {
        Wallet {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: &[u8]) -> Result<Wallet> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| Error::Key("secret key must be 32 bytes".to_string()))?;
        Ok(Wallet {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn identity(&self) -> Identity {
        Identity::from(&self.signing_key.verifying_key())
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Checks `signature` over `message` against `identity`. Malformed keys or
/// signatures verify as false.
pub fn verify(message: &[u8], signature: &[u8], identity: &Identity) -> bool {
    let key = match identity.verifying_key() {
        Ok(k) => k,
        Err(_) => return false,
    };
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}
