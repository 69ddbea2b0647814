//! Credential stores consulted when no explicit credentials are configured.
//!
//! The default chain checks the platform keychain (entries written by
//! `regman login`) and then the Docker CLI configuration, including its
//! credential helpers.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use base64::Engine;
use serde::Deserialize;

use super::Credentials;
use crate::error::RegmanError;

const KEYRING_SERVICE: &str = "regman";
const DOCKER_HUB_KEY: &str = "index.docker.io";
const DOCKER_HUB_SERVER_URL: &str = "https://index.docker.io/v1/";

pub trait CredentialStore: Send + Sync {
    fn lookup(&self, host: &str) -> Result<Option<Credentials>, RegmanError>;
}

/// Reduces a registry host or Docker config key (`https://ghcr.io/v1/`) to
/// a comparable host name.
fn registry_key(value: &str) -> String {
    let value = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value);
    let host = value.split('/').next().unwrap_or_default();
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_KEY.to_string(),
        other => other.to_string(),
    }
}

/// The platform keychain (macOS Keychain, Secret Service, Windows
/// Credential Manager).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        KeyringStore {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, host: &str) -> Result<keyring::Entry, RegmanError> {
        keyring::Entry::new(&self.service, &registry_key(host))
            .map_err(|e| RegmanError::CredentialStore(e.to_string()))
    }

    pub fn save(&self, host: &str, credentials: &Credentials) -> Result<(), RegmanError> {
        let serialized = serde_json::to_string(credentials)
            .map_err(|e| RegmanError::CredentialStore(e.to_string()))?;
        self.entry(host)?
            .set_password(&serialized)
            .map_err(|e| RegmanError::CredentialStore(e.to_string()))?;
        log::debug!("Credentials for {host} saved to keyring");
        Ok(())
    }

    /// Returns whether an entry existed.
    pub fn delete(&self, host: &str) -> Result<bool, RegmanError> {
        match self.entry(host)?.delete_credential() {
            Ok(()) => {
                log::debug!("Credentials for {host} deleted from keyring");
                Ok(true)
            }
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(RegmanError::CredentialStore(e.to_string())),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn lookup(&self, host: &str) -> Result<Option<Credentials>, RegmanError> {
        let secret = match self.entry(host).and_then(|entry| {
            entry
                .get_password()
                .map_err(|e| RegmanError::CredentialStore(e.to_string()))
        }) {
            Ok(secret) => secret,
            Err(e) => {
                // No entry, or no keychain service on this machine.
                log::debug!("Keyring lookup for {host} failed: {e}");
                return Ok(None);
            }
        };

        match serde_json::from_str(&secret) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                log::warn!("Ignoring unreadable keyring entry for {host}: {e}");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,

    #[serde(rename = "credsStore")]
    pub creds_store: Option<String>,

    #[serde(rename = "credHelpers", default)]
    pub cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64 of `username:password`.
    pub auth: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DockerAuthEntry {
    fn decode(&self) -> Option<Credentials> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(self.auth.as_deref()?.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl DockerConfig {
    /// Helper configured for `host`: a per-registry entry, else the global
    /// store.
    fn helper_for(&self, host: &str) -> Option<&str> {
        let key = registry_key(host);
        self.cred_helpers
            .iter()
            .find(|(registry, _)| registry_key(registry) == key)
            .map(|(_, helper)| helper.as_str())
            .or(self.creds_store.as_deref())
            .filter(|helper| !helper.is_empty())
    }

    fn auth_for(&self, host: &str) -> Option<Credentials> {
        let key = registry_key(host);
        self.auths
            .iter()
            .filter(|(registry, _)| registry_key(registry) == key)
            .find_map(|(_, entry)| entry.decode())
    }
}

/// `docker login` credentials from `$DOCKER_CONFIG/config.json` or
/// `~/.docker/config.json`.
pub struct DockerConfigStore {
    path: Option<PathBuf>,
}

impl DockerConfigStore {
    pub fn new() -> Self {
        let path = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
            .map(|dir| dir.join("config.json"));
        DockerConfigStore { path }
    }

    pub fn with_path(path: PathBuf) -> Self {
        DockerConfigStore { path: Some(path) }
    }

    fn load(&self) -> Result<Option<DockerConfig>, RegmanError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            RegmanError::CredentialStore(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&content).map_err(|e| {
            RegmanError::CredentialStore(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(config))
    }
}

impl Default for DockerConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for DockerConfigStore {
    fn lookup(&self, host: &str) -> Result<Option<Credentials>, RegmanError> {
        let Some(config) = self.load()? else {
            return Ok(None);
        };

        if let Some(helper) = config.helper_for(host) {
            if let Some(credentials) = run_credential_helper(helper, host) {
                return Ok(Some(credentials));
            }
        }
        Ok(config.auth_for(host))
    }
}

#[derive(Deserialize)]
struct HelperCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Runs `docker-credential-<helper> get` with the server URL on stdin.
/// Any failure is treated as "no credentials".
fn run_credential_helper(helper: &str, host: &str) -> Option<Credentials> {
    let program = format!("docker-credential-{helper}");
    let server = if registry_key(host) == DOCKER_HUB_KEY {
        DOCKER_HUB_SERVER_URL.to_string()
    } else {
        host.to_string()
    };

    let mut child = match Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log::debug!("Could not run {program}: {e}");
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(server.as_bytes()) {
            log::debug!("Could not write to {program}: {e}");
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            log::debug!("{program} failed: {e}");
            return None;
        }
    };
    if !output.status.success() {
        log::debug!(
            "{program} found nothing for {server}: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        return None;
    }

    match serde_json::from_slice::<HelperCredentials>(&output.stdout) {
        Ok(found) => Some(Credentials {
            username: found.username,
            password: found.secret,
        }),
        Err(e) => {
            log::warn!("Ignoring unreadable output of {program}: {e}");
            None
        }
    }
}

/// Ordered chain of stores; the first one holding credentials wins.
pub struct DefaultKeychain {
    stores: Vec<Box<dyn CredentialStore>>,
}

impl DefaultKeychain {
    pub fn new(stores: Vec<Box<dyn CredentialStore>>) -> Self {
        DefaultKeychain { stores }
    }
}

impl Default for DefaultKeychain {
    fn default() -> Self {
        DefaultKeychain::new(vec![
            Box::new(KeyringStore::new()),
            Box::new(DockerConfigStore::new()),
        ])
    }
}

impl CredentialStore for DefaultKeychain {
    fn lookup(&self, host: &str) -> Result<Option<Credentials>, RegmanError> {
        for store in &self.stores {
            if let Some(credentials) = store.lookup(host)? {
                return Ok(Some(credentials));
            }
        }
        Ok(None)
    }
}
