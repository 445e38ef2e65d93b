use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use log::{info, warn};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::settings::load_accounts;

#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct Account {
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub smtp: ServerInfo,
    pub pop3: ServerInfo,
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub delete_after_read: bool,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("key", &self.key)
            .field("smtp", &self.smtp)
            .field("pop3", &self.pop3)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub encryption: bool,
}

impl ServerInfo {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// How a requested key is matched against configured account keys.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyMatch {
    #[default]
    Exact,
    /// The requested key only has to contain the configured key.
    Substring,
}

/// The configured accounts. Lookups work on a snapshot so a reload never
/// changes an account under a running operation.
pub struct AccountDirectory {
    accounts: RwLock<Arc<Vec<Account>>>,
    lookup: KeyMatch,
    source: Option<PathBuf>,
}

impl AccountDirectory {
    pub fn new(accounts: Vec<Account>, lookup: KeyMatch) -> Self {
        AccountDirectory { accounts: RwLock::new(Arc::new(accounts)), lookup, source: None }
    }

    pub fn from_file(path: &Path, lookup: KeyMatch) -> Self {
        AccountDirectory {
            accounts: RwLock::new(Arc::new(load_accounts(path))),
            lookup,
            source: Some(path.to_path_buf()),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Account>> {
        Arc::clone(&self.accounts.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot().iter().map(|account| account.key.clone()).collect()
    }

    pub fn resolve(&self, key: &str) -> Result<Account> {
        find_account(&self.snapshot(), key, self.lookup)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(key.to_string()))
    }

    /// Re-reads the account file, if the directory was loaded from one.
    pub fn reload(&self) {
        let Some(path) = &self.source else {
            warn!("Account directory has no file to reload from");
            return;
        };
        let accounts = load_accounts(path);
        info!("Reloaded {} account(s)", accounts.len());
        *self.accounts.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(accounts);
    }
}

fn find_account<'a>(accounts: &'a [Account], key: &str, lookup: KeyMatch) -> Option<&'a Account> {
    match lookup {
        KeyMatch::Exact => accounts.iter().find(|account| account.key == key),
        KeyMatch::Substring => accounts
            .iter()
            .find(|account| !account.key.is_empty() && key.contains(account.key.as_str())),
    }
}

#[cfg(test)]
pub(crate) fn test_account(key: &str) -> Account {
    Account {
        key: key.to_string(),
        description: String::new(),
        smtp: ServerInfo { hostname: "smtp.example.org".to_string(), port: 465, encryption: true },
        pop3: ServerInfo { hostname: "pop.example.org".to_string(), port: 995, encryption: true },
        email: format!("{}@example.org", key),
        username: key.to_string(),
        password: "secret".to_string(),
        delete_after_read: false,
    }
}
