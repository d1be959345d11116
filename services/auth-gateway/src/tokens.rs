use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// A pre-shared credential that authorizes a calling service.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    pub key: String,
}

impl Token {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("multiple tokens exist with the name {name:?}")]
    DuplicateName { name: String },
    #[error("token #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("no token named {0:?}")]
    NotFound(String),
}

/// Read-only `name -> key` map, built once at startup.
#[derive(Clone, Default)]
pub struct TokenRegistry {
    keys: HashMap<String, StoredKey>,
}

#[derive(Clone)]
struct StoredKey {
    key: String,
    digest: [u8; 32],
}

fn key_digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

impl TokenRegistry {
    /// Build the registry, failing on the first empty or repeated name.
    pub fn build<I>(tokens: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Token>,
    {
        let mut keys = HashMap::new();
        for (index, token) in tokens.into_iter().enumerate() {
            if token.name.is_empty() {
                return Err(RegistryError::EmptyName { index });
            }
            if keys.contains_key(&token.name) {
                return Err(RegistryError::DuplicateName { name: token.name });
            }
            let digest = key_digest(&token.key);
            keys.insert(
                token.name,
                StoredKey {
                    key: token.key,
                    digest,
                },
            );
        }
        Ok(Self { keys })
    }

    pub fn lookup(&self, name: &str) -> Result<&str, RegistryError> {
        self.keys
            .get(name)
            .map(|stored| stored.key.as_str())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// True only when `name` exists and `presented` equals its key. Unknown
    /// names and wrong keys are indistinguishable to the caller.
    ///
    /// Keys are compared as SHA-256 digests so the comparison takes the same
    /// time whatever the length of either key.
    pub fn verify(&self, name: &str, presented: &str) -> bool {
        let presented = key_digest(presented);
        match self.keys.get(name) {
            Some(stored) => bool::from(stored.digest[..].ct_eq(&presented[..])),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Token names in sorted order, for logging.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("names", &self.names())
            .finish()
    }
}
