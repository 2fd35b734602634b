//! Flat-file credential check
//!
//! One `username password` pair per line, separated by a single space.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Cannot read credential file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

impl Credentials {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let credentials = Self::parse(&content);
        debug!(path = ?path, users = credentials.len(), "Loaded credentials");
        Ok(credentials)
    }

    /// Lines without a password are ignored; the first entry for a user wins
    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            let Some((username, password)) = line.split_once(' ') else {
                continue;
            };
            if username.is_empty() {
                continue;
            }
            users
                .entry(username.to_string())
                .or_insert_with(|| password.to_string());
        }
        Self { users }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
