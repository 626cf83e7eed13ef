//! Account storage held by a node
//!
//! Records are keyed by account ID. The map lock is only held to find or
//! create a record; every mutation of a record goes through the record's own
//! lock, so concurrent pushes to one account serialize while pushes to
//! different accounts do not contend.

use crate::lock;
use passtor_core::{Account, Hash};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Reasons a record is refused. The `Display` strings travel on the wire as
/// allocation reply errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("does not verify")]
    DoesNotVerify,

    #[error("public key changed")]
    PublicKeyChanged,

    #[error("already stored")]
    AlreadyStored,
}

/// A stored record and the replication factor it was pushed with
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub account: Account,
    pub replication: u32,
    /// Set once the record has been taken out of the map
    removed: bool,
}

impl AccountInfo {
    fn new(account: Account, replication: u32) -> Self {
        Self {
            account,
            replication,
            removed: false,
        }
    }
}

/// Storage for account records
#[derive(Default)]
pub struct AccountStore {
    accounts: Mutex<HashMap<Hash, Arc<Mutex<AccountInfo>>>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record if it verifies and is newer than what we hold.
    ///
    /// The first verified record for an ID is always accepted. Afterwards the
    /// public key is pinned and versions must strictly increase.
    pub fn store(&self, account: Account, replication: u32) -> Result<(), StoreError> {
        if !account.verify() {
            return Err(StoreError::DoesNotVerify);
        }

        loop {
            let record = {
                let mut accounts = lock(&self.accounts);
                match accounts.entry(account.id) {
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(Mutex::new(AccountInfo::new(account, replication))));
                        return Ok(());
                    }
                    Entry::Occupied(slot) => slot.get().clone(),
                }
            };

            let mut info = lock(&record);
            if info.removed {
                // Lost a race with a republish; look the ID up again
                continue;
            }
            if info.account.public_key != account.public_key {
                return Err(StoreError::PublicKeyChanged);
            }
            if account.version <= info.account.version {
                return Err(StoreError::AlreadyStored);
            }
            info.account = account;
            info.replication = replication;
            return Ok(());
        }
    }

    /// Whether this exact record (same signature) is already stored
    pub fn holds(&self, account: &Account) -> bool {
        self.record(&account.id)
            .map(|record| lock(&record).account.signature == account.signature)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &Hash) -> Option<Account> {
        self.record(id).map(|record| lock(&record).account.clone())
    }

    pub fn get_info(&self, id: &Hash) -> Option<AccountInfo> {
        self.record(id).map(|record| lock(&record).clone())
    }

    /// Stored version of an account
    pub fn version(&self, id: &Hash) -> Option<u64> {
        self.record(id).map(|record| lock(&record).account.version)
    }

    /// Remove a record only if its version is still `version`
    pub fn remove_if_version(&self, id: &Hash, version: u64) -> Option<AccountInfo> {
        let mut accounts = lock(&self.accounts);
        let record = accounts.get(id)?.clone();
        let mut info = lock(&record);
        if info.account.version != version {
            return None;
        }
        info.removed = true;
        accounts.remove(id);
        Some(info.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.accounts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<Hash> {
        lock(&self.accounts).keys().copied().collect()
    }

    fn record(&self, id: &Hash) -> Option<Arc<Mutex<AccountInfo>>> {
        lock(&self.accounts).get(id).cloned()
    }
}
