//! Signed account records
//!
//! An account is an already-encrypted vault: nodes never see plaintext logins.
//! What nodes do rely on is the envelope around it: the account ID, the
//! embedded ed25519 public key, a version that only ever grows, and a signature
//! over everything else.

use crate::proto::{AccountNetwork, LoginNetwork};
use crate::types::{bytes_to_hash, Hash};
use crate::{Error, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use prost::Message;
use std::collections::BTreeMap;

/// Size in bytes of an embedded public key
pub const PUBLIC_KEY_SIZE: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Size in bytes of an account signature
pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;

pub type PublicKey = [u8; PUBLIC_KEY_SIZE];
pub type Signature = [u8; SIGNATURE_SIZE];

/// One encrypted login entry of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub id: Hash,
    /// Encrypted service name
    pub service: Vec<u8>,
    /// Encrypted username and password
    pub credentials: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Hash,
    pub public_key: PublicKey,
    pub version: u64,
    /// Encrypted key material and metadata
    pub keys: Vec<u8>,
    pub logins: BTreeMap<Hash, Login>,
    pub signature: Signature,
}

impl Account {
    /// Create an empty, unsigned account at version 0
    pub fn new(id: Hash, keys: Vec<u8>) -> Self {
        Self {
            id,
            public_key: [0u8; PUBLIC_KEY_SIZE],
            version: 0,
            keys,
            logins: BTreeMap::new(),
            signature: [0u8; SIGNATURE_SIZE],
        }
    }

    /// Add or replace a login and bump the version. The account must be signed again.
    pub fn upsert_login(&mut self, login: Login) {
        self.logins.insert(login.id, login);
        self.version += 1;
    }

    /// Remove a login and bump the version. The account must be signed again.
    pub fn remove_login(&mut self, id: &Hash) -> Option<Login> {
        let removed = self.logins.remove(id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    /// Bytes covered by the signature: the network encoding with an empty signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut network = self.to_network();
        network.signature.clear();
        network.encode_to_vec()
    }

    /// Embed the key's public half and sign the record
    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.public_key = key.verifying_key().to_bytes();
        self.signature = key.sign(&self.signing_bytes()).to_bytes();
        self
    }

    /// Check the signature under the embedded public key
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature);
        key.verify(&self.signing_bytes(), &signature).is_ok()
    }

    /// Convert to the wire form, logins ordered by ID
    pub fn to_network(&self) -> AccountNetwork {
        AccountNetwork {
            id: self.id.to_vec(),
            public_key: self.public_key.to_vec(),
            version: self.version,
            keys: self.keys.clone(),
            logins: self
                .logins
                .values()
                .map(|login| LoginNetwork {
                    id: login.id.to_vec(),
                    service: login.service.clone(),
                    credentials: login.credentials.clone(),
                })
                .collect(),
            signature: self.signature.to_vec(),
        }
    }

    /// Parse the wire form, validating every fixed-size field
    pub fn from_network(network: AccountNetwork) -> Result<Self> {
        let public_key: PublicKey = network.public_key.as_slice().try_into().map_err(|_| {
            Error::InvalidData(format!("public key has {} bytes", network.public_key.len()))
        })?;
        let signature: Signature = network.signature.as_slice().try_into().map_err(|_| {
            Error::InvalidData(format!("signature has {} bytes", network.signature.len()))
        })?;

        let mut logins = BTreeMap::new();
        for login in network.logins {
            let id = bytes_to_hash(&login.id)?;
            if logins.contains_key(&id) {
                return Err(Error::InvalidData("duplicate login id".to_string()));
            }
            logins.insert(
                id,
                Login {
                    id,
                    service: login.service,
                    credentials: login.credentials,
                },
            );
        }

        Ok(Self {
            id: bytes_to_hash(&network.id)?,
            public_key,
            version: network.version,
            keys: network.keys,
            logins,
            signature,
        })
    }
}

impl TryFrom<AccountNetwork> for Account {
    type Error = Error;

    fn try_from(network: AccountNetwork) -> Result<Self> {
        Self::from_network(network)
    }
}

impl From<&Account> for AccountNetwork {
    fn from(account: &Account) -> Self {
        account.to_network()
    }
}
