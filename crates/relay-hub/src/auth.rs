use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// Issues session tickets for the relay. Password storage and ACL checks
/// live behind this boundary.
pub trait Authenticator: Send {
    fn login(&mut self, username: &str, credential: &str) -> Result<String, AuthError>;

    /// Invalidates `ticket`. Unknown tickets are ignored.
    fn logout(&mut self, ticket: &str);
}

#[derive(Debug, Deserialize)]
struct UserTable {
    users: HashMap<String, String>,
}

/// Checks credentials against a fixed user table. Entries are either the
/// plain credential or `sha256:<hex digest>`.
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
    tickets: HashSet<String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users,
            tickets: HashSet::new(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read user table {}", path.display()))?;
        let table: UserTable = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse user table {}", path.display()))?;
        info!(event = "user_table_loaded", users = table.users.len());
        Ok(Self::new(table.users))
    }

    #[cfg(test)]
    pub fn live_tickets(&self) -> usize {
        self.tickets.len()
    }
}

impl Authenticator for StaticAuthenticator {
    fn login(&mut self, username: &str, credential: &str) -> Result<String, AuthError> {
        let Some(expected) = self.users.get(username) else {
            warn!(event = "login_unknown_user", identity = username);
            return Err(AuthError::AuthenticationFailed(
                "invalid credentials".to_string(),
            ));
        };
        if !credential_matches(expected, credential) {
            warn!(event = "login_bad_credential", identity = username);
            return Err(AuthError::AuthenticationFailed(
                "invalid credentials".to_string(),
            ));
        }
        let ticket = mint_ticket();
        self.tickets.insert(ticket.clone());
        Ok(ticket)
    }

    fn logout(&mut self, ticket: &str) {
        self.tickets.remove(ticket);
    }
}

/// Accepts every login with a non-empty username.
#[derive(Default)]
pub struct OpenAuthenticator {
    tickets: HashSet<String>,
}

impl Authenticator for OpenAuthenticator {
    fn login(&mut self, username: &str, _credential: &str) -> Result<String, AuthError> {
        if username.trim().is_empty() {
            return Err(AuthError::AuthenticationFailed(
                "username is required".to_string(),
            ));
        }
        let ticket = mint_ticket();
        self.tickets.insert(ticket.clone());
        Ok(ticket)
    }

    fn logout(&mut self, ticket: &str) {
        self.tickets.remove(ticket);
    }
}

fn mint_ticket() -> String {
    Uuid::new_v4().to_string()
}

fn credential_matches(expected: &str, credential: &str) -> bool {
    match expected.strip_prefix(SHA256_PREFIX) {
        Some(digest) => digest.eq_ignore_ascii_case(&sha256_hex(credential)),
        None => expected == credential,
    }
}

fn sha256_hex(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
