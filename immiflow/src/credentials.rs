//! Credential references and their resolution into transient tokens.
//!
//! Loaders hold only a [`CredentialRef`]. They resolve it on every
//! invocation and hand the resulting [`AccessToken`] to the warehouse
//! request; tokens are never stored or logged.

use crate::errors::CredentialError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};

/// An opaque reference to a credential (role name, profile, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The reference name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for CredentialRef {
    fn default() -> Self {
        Self::new("warehouse-loader")
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved, short-lived secret. Its `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the secret to the component that needs it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Resolves credential references into tokens.
#[async_trait]
pub trait CredentialResolver: Send + Sync + Debug {
    /// Resolves a reference.
    async fn resolve(&self, reference: &CredentialRef) -> Result<AccessToken, CredentialError>;
}

/// Resolver backed by a fixed map.
#[derive(Default)]
pub struct StaticCredentialResolver {
    tokens: HashMap<String, String>,
}

impl StaticCredentialResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for a reference name.
    #[must_use]
    pub fn with_token(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.tokens.insert(name.into(), secret.into());
        self
    }
}

impl Debug for StaticCredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.tokens.keys().collect();
        names.sort();
        f.debug_struct("StaticCredentialResolver")
            .field("names", &names)
            .finish()
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, reference: &CredentialRef) -> Result<AccessToken, CredentialError> {
        self.tokens
            .get(reference.name())
            .map(|secret| AccessToken::new(secret.clone()))
            .ok_or_else(|| CredentialError::Unresolved(reference.to_string()))
    }
}

/// Resolver that reads `{prefix}{REFERENCE}` from the environment.
///
/// The reference is upper-cased and `-`/`.` become `_`, so `warehouse-loader`
/// with prefix `IMMIFLOW_CREDENTIAL_` reads `IMMIFLOW_CREDENTIAL_WAREHOUSE_LOADER`.
#[derive(Debug, Clone)]
pub struct EnvCredentialResolver {
    prefix: String,
}

impl Default for EnvCredentialResolver {
    fn default() -> Self {
        Self::new("IMMIFLOW_CREDENTIAL_")
    }
}

impl EnvCredentialResolver {
    /// Creates a resolver with a variable prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The environment variable consulted for a reference.
    #[must_use]
    pub fn variable_for(&self, reference: &CredentialRef) -> String {
        let suffix: String = reference
            .name()
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{suffix}", self.prefix)
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, reference: &CredentialRef) -> Result<AccessToken, CredentialError> {
        let variable = self.variable_for(reference);
        match std::env::var(&variable) {
            Ok(secret) if !secret.is_empty() => Ok(AccessToken::new(secret)),
            _ => Err(CredentialError::Unresolved(format!("{reference} (${variable})"))),
        }
    }
}
