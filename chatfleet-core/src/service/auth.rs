//! Credential verification boundary.
//!
//! Workers never look at stored credentials directly: they hand username and
//! password to a [`CredentialVerifier`] and get an [`Identity`] back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task;

use crate::models::Identity;
use crate::{Error, Result};

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;

#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    /// Check a username/password pair.
    async fn verify(&self, username: &str, password: &str) -> Result<Identity>;

    /// Create a new account. Fails if the username is taken.
    async fn register(&self, username: &str, password: &str) -> Result<Identity>;
}

/// Usernames are 3-32 characters of ASCII letters, digits, `_` or `-`.
pub fn validate_username(username: &str) -> Result<()> {
    let len = username.len();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(Error::Authentication(format!(
            "Username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Authentication(
            "Username may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

struct Account {
    user_id: i64,
    password_hash: String,
}

/// Process-local account directory.
///
/// Only suitable for development and single-process mode: accounts vanish
/// on restart and are invisible to other workers.
pub struct InMemoryDirectory {
    accounts: RwLock<HashMap<String, Account>>,
    next_id: AtomicI64,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl CredentialVerifier for InMemoryDirectory {
    async fn verify(&self, username: &str, password: &str) -> Result<Identity> {
        let stored = self
            .accounts
            .read()
            .get(username)
            .map(|account| (account.user_id, account.password_hash.clone()));

        let Some((user_id, hash)) = stored else {
            return Err(Error::Authentication("Invalid username or password".to_string()));
        };

        if verify_password(password, &hash).await? {
            Ok(Identity::new(user_id, username))
        } else {
            Err(Error::Authentication("Invalid username or password".to_string()))
        }
    }

    async fn register(&self, username: &str, password: &str) -> Result<Identity> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(Error::Authentication("Password must not be empty".to_string()));
        }
        if self.accounts.read().contains_key(username) {
            return Err(Error::Authentication(format!("Username {username} is taken")));
        }

        let password_hash = hash_password(password).await?;

        let mut accounts = self.accounts.write();
        if accounts.contains_key(username) {
            return Err(Error::Authentication(format!("Username {username} is taken")));
        }
        let user_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        accounts.insert(
            username.to_string(),
            Account {
                user_id,
                password_hash,
            },
        );

        Ok(Identity::new(user_id, username))
    }
}

async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();

    task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Authentication(format!("Failed to hash password: {e}")))
    })
    .await
    .map_err(|e| Error::Authentication(format!("Password hashing task failed: {e}")))?
}

async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();

    task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| Error::Authentication(format!("Invalid password hash: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Authentication(format!(
                "Password verification failed: {e}"
            ))),
        }
    })
    .await
    .map_err(|e| Error::Authentication(format!("Password verification task failed: {e}")))?
}
