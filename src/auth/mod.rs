//! Choosing how a registry call authenticates.
//!
//! Resolution is a pure decision made once per invocation: the first
//! strategy that yields a [`CredentialSet`] wins and nothing is merged.
//! Looking up stored credentials happens later, at dispatch time.

use std::fmt;

use crate::config::Settings;
use crate::error::RegmanError;
use crate::reference::RegistryEndpoint;

pub mod keychain;

use keychain::CredentialStore;

#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSet {
    /// Username and password given through flags, environment or config.
    Explicit(Credentials),
    /// Whatever the credential store holds for this registry host.
    Keychain { host: String },
    Anonymous,
}

impl CredentialSet {
    /// Materializes the credentials to send, consulting `store` only for
    /// [`CredentialSet::Keychain`].
    pub fn credentials(
        &self,
        store: &dyn CredentialStore,
    ) -> Result<Option<Credentials>, RegmanError> {
        match self {
            CredentialSet::Explicit(credentials) => Ok(Some(credentials.clone())),
            CredentialSet::Keychain { host } => {
                let found = store.lookup(host)?;
                if found.is_none() {
                    log::debug!("No stored credentials for {host}, continuing anonymously");
                }
                Ok(found)
            }
            CredentialSet::Anonymous => Ok(None),
        }
    }
}

pub type Strategy = fn(&Settings, &RegistryEndpoint) -> Option<CredentialSet>;

/// Explicit username/password, if either one is set.
pub fn explicit_credentials(settings: &Settings, _: &RegistryEndpoint) -> Option<CredentialSet> {
    if settings.user.is_empty() && settings.pass.is_empty() {
        return None;
    }
    Some(CredentialSet::Explicit(Credentials {
        username: settings.user.clone(),
        password: settings.pass.clone(),
    }))
}

/// Credential store lookup keyed by the registry host.
pub fn keychain_credentials(_: &Settings, registry: &RegistryEndpoint) -> Option<CredentialSet> {
    Some(CredentialSet::Keychain {
        host: registry.as_str().to_string(),
    })
}

pub struct CredentialResolver {
    strategies: Vec<(&'static str, Strategy)>,
}

impl CredentialResolver {
    pub fn new(strategies: Vec<(&'static str, Strategy)>) -> Self {
        CredentialResolver { strategies }
    }

    pub fn resolve(&self, settings: &Settings, registry: &RegistryEndpoint) -> CredentialSet {
        for (name, strategy) in &self.strategies {
            if let Some(set) = strategy(settings, registry) {
                log::debug!("Using {name} credentials for {registry}");
                return set;
            }
        }
        CredentialSet::Anonymous
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        CredentialResolver::new(vec![
            ("explicit", explicit_credentials as Strategy),
            ("keychain", keychain_credentials as Strategy),
        ])
    }
}
