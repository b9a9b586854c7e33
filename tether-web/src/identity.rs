//! Credential verification collaborator
//!
//! The session core never checks credentials itself; login hands them to an
//! [`IdentityProvider`] and only continues with the user id it returns.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tether_session::UserId;
use tracing::warn;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the user id for valid credentials
    async fn authenticate(&self, username: &str, password: &str) -> Option<UserId>;
}

/// Fixed user table for development and tests
///
/// Passwords are held as Argon2id PHC strings, each with its own salt.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    users: HashMap<String, (String, UserId)>,
    params: Params,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash passwords added after this call with `params` instead of the Argon2 defaults
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_user(mut self, username: &str, password: &str, user_id: UserId) -> Self {
        match hash_password(&self.params, password) {
            Ok(hash) => {
                self.users.insert(username.to_string(), (hash, user_id));
            }
            Err(e) => warn!(username, error = %e, "Could not hash password, user skipped"),
        }
        self
    }

    /// Add a user whose password is already an Argon2 PHC string
    pub fn with_password_hash(mut self, username: &str, phc: &str, user_id: UserId) -> Self {
        match PasswordHash::new(phc) {
            Ok(_) => {
                self.users
                    .insert(username.to_string(), (phc.to_string(), user_id));
            }
            Err(e) => warn!(username, error = %e, "Ignoring malformed password hash"),
        }
        self
    }

    /// Parse `name:password:user_id` entries separated by commas
    pub fn from_spec(spec: &str) -> Self {
        let mut provider = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next().map(str::parse::<i64>)) {
                (Some(name), Some(password), Some(Ok(id))) => {
                    provider = provider.with_user(name, password, UserId(id));
                }
                _ => warn!(entry, "Ignoring malformed user entry"),
            }
        }
        provider
    }

    pub fn from_env(var: &str) -> Self {
        std::env::var(var)
            .map(|spec| Self::from_spec(&spec))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Stored PHC string for `username`
    pub fn password_hash(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|(hash, _)| hash.as_str())
    }
}

/// Hash password using Argon2id
fn hash_password(params: &Params, password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Verify password against a PHC string; the cost parameters come from the hash
fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, username: &str, password: &str) -> Option<UserId> {
        let (hash, user_id) = self.users.get(username)?;
        verify_password(password, hash).then_some(*user_id)
    }
}
