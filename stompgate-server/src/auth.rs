//! Login credential checks.
//!
//! Passcodes are compared as SHA-256 hashes, so configuration never holds
//! them in plaintext.

use crate::config::AuthConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Validates CONNECT credentials against configured passcode hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialValidator {
    /// Login to lowercase SHA-256 hex of the passcode.
    users: HashMap<String, String>,
}

impl CredentialValidator {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|(login, hash)| (login, hash.to_ascii_lowercase()))
                .collect(),
        }
    }

    /// Builds a validator from the `auth` section, or `None` when
    /// authentication is not required.
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        if config.is_disabled() {
            return None;
        }
        Some(Self::new(
            config
                .users
                .iter()
                .map(|(login, hash)| (login.clone(), hash.clone())),
        ))
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Checks a login and plaintext passcode.
    pub fn validate(&self, login: &str, passcode: &str) -> bool {
        match self.users.get(login) {
            Some(expected) => *expected == Self::hash_passcode(passcode),
            None => false,
        }
    }

    /// Hashes a passcode using SHA-256, returning a lowercase hex string.
    pub fn hash_passcode(passcode: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(passcode.as_bytes());
        hex::encode(hasher.finalize())
    }
}
