//! Credential store backing the login and registration pages.
//!
//! Users live in a [`UserTable`], optionally persisted as a YAML map of
//! `username: password`. Request handlers reach it through a bounded
//! [`ConnPool`] of [`UserConn`] handles, so the number of workers touching
//! the table at once is capped the same way a database pool would cap it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pool::ConnPool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access user table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed user table {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The checks behind `/login.html` and `/register.html`.
pub trait Authenticator: Send + Sync {
    /// True if `username` exists and `password` matches.
    fn login(&self, username: &str, password: &str) -> bool;

    /// True if `username` was unused and has now been created.
    fn register(&self, username: &str, password: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct UserTable {
    users: RwLock<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl UserTable {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the table from `path`. A missing file is an empty table that
    /// will be created on the first registration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let users = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_yaml::from_str(&text).map_err(|source| StoreError::Yaml {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        info!(path = %path.display(), users = users.len(), "user table loaded");
        Ok(Self {
            users: RwLock::new(users),
            path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn password_of(&self, username: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    fn insert(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_owned(), password.to_owned());

        if let Err(e) = self.persist(&users) {
            users.remove(username);
            return Err(e);
        }
        Ok(true)
    }

    fn persist(&self, users: &HashMap<String, String>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_yaml::to_string(users).map_err(|source| StoreError::Yaml {
            path: path.clone(),
            source,
        })?;
        fs::write(path, text).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })
    }
}

/// One pooled handle onto a shared [`UserTable`].
#[derive(Debug, Clone)]
pub struct UserConn {
    table: Arc<UserTable>,
}

impl UserConn {
    pub fn new(table: Arc<UserTable>) -> Self {
        Self { table }
    }

    pub fn find_password(&self, username: &str) -> Option<String> {
        self.table.password_of(username)
    }

    /// Returns `Ok(false)` if the username is already taken.
    pub fn insert_user(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        self.table.insert(username, password)
    }
}

#[derive(Debug)]
pub struct UserStore {
    pool: ConnPool<UserConn>,
}

impl UserStore {
    pub fn new(table: UserTable, pool_size: usize) -> Self {
        let table = Arc::new(table);
        let conns = (0..pool_size).map(|_| UserConn::new(Arc::clone(&table))).collect();
        Self {
            pool: ConnPool::new(conns),
        }
    }

    pub fn pool(&self) -> &ConnPool<UserConn> {
        &self.pool
    }

    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        debug!(user = username, is_login, "verifying credentials");

        let conn = match self.pool.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(cause = %e, "no store connection for credential check");
                return false;
            }
        };

        match (conn.find_password(username), is_login) {
            (Some(stored), true) => {
                let ok = stored == password;
                if !ok {
                    debug!(user = username, "password mismatch");
                }
                ok
            }
            (Some(_), false) => {
                debug!(user = username, "username already taken");
                false
            }
            (None, true) => false,
            (None, false) => match conn.insert_user(username, password) {
                Ok(inserted) => inserted,
                Err(e) => {
                    error!(cause = %e, "failed to store new user");
                    false
                }
            },
        }
    }
}

impl Authenticator for UserStore {
    fn login(&self, username: &str, password: &str) -> bool {
        self.verify(username, password, true)
    }

    fn register(&self, username: &str, password: &str) -> bool {
        self.verify(username, password, false)
    }
}
