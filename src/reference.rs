//! Turning user supplied registry URLs and short image names into fully
//! qualified registry references.
//!
//! The registry host always comes from configuration and the image name
//! from the command line. Tag/digest detection only ever looks at the image
//! name, so a registry host with a port (`host:5000`) is never mistaken for
//! a tagged reference.

use std::borrow::Cow;
use std::fmt;

use oci_spec::distribution::Reference;

use crate::error::RegmanError;

pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "index.docker.io";

/// A registry `host[:port]`, never carrying a URL scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryEndpoint(String);

impl RegistryEndpoint {
    /// Builds the endpoint from the configured registry value, which may be
    /// written as a URL (`https://my-registry.com/`).
    pub fn parse(base: &str) -> Result<Self, RegmanError> {
        let host = base.trim();
        let host = host
            .strip_prefix("https://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host)
            .trim_end_matches('/');

        if host.is_empty() {
            return Err(RegmanError::Configuration(
                "registry URL is required (via --registry, REGMAN_REGISTRY env, or config file)"
                    .to_string(),
            ));
        }
        validate_host(host)?;

        Ok(RegistryEndpoint(host.to_string()))
    }

    /// Same as [`RegistryEndpoint::parse`] but for a possibly unset value.
    pub fn from_config(registry: Option<&str>) -> Result<Self, RegmanError> {
        Self::parse(registry.unwrap_or_default())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host to send API requests to. Docker Hub serves its API under a
    /// different name than the one used in references.
    pub fn api_host(&self) -> &str {
        if self.0 == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.0
        }
    }
}

impl fmt::Display for RegistryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_host(host: &str) -> Result<(), RegmanError> {
    let invalid = |reason: &str| {
        Err(RegmanError::Configuration(format!(
            "invalid registry '{host}': {reason}"
        )))
    };

    if host.contains('/') {
        return invalid("expected host[:port] without a path");
    }

    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    if let Some(port) = port {
        if port.parse::<u16>().is_err() {
            return invalid("port must be a number between 0 and 65535");
        }
    }
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return invalid("host may only contain letters, digits, '.' and '-'");
    }
    // Anything else would be read as the first path component of a Docker
    // Hub repository by the reference grammar.
    if !(name.contains('.') || port.is_some() || name == "localhost") {
        return invalid("host must contain a '.' or a port, or be 'localhost'");
    }
    Ok(())
}

/// Appends `:latest` to names carrying neither a tag nor a digest. Only the
/// image name is inspected, never the registry host.
pub fn normalize_name(name: &str) -> Cow<'_, str> {
    if name.contains('@') || name.contains(':') {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}:{DEFAULT_TAG}"))
    }
}

fn parse_reference(input: &str, composed: &str) -> Result<Reference, RegmanError> {
    composed
        .parse::<Reference>()
        .map_err(|e| RegmanError::ReferenceParse {
            input: input.to_string(),
            reason: format!("{e} (while parsing '{composed}')"),
        })
}

/// A registry plus repository path, without tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    registry: RegistryEndpoint,
    repository: String,
}

impl RepositoryRef {
    pub fn parse(registry: &RegistryEndpoint, name: &str) -> Result<Self, RegmanError> {
        if name.is_empty() {
            return Err(RegmanError::ReferenceParse {
                input: name.to_string(),
                reason: "repository name is empty".to_string(),
            });
        }
        if name.contains('@') || name.contains(':') {
            return Err(RegmanError::ReferenceParse {
                input: name.to_string(),
                reason: "a repository name takes no tag or digest".to_string(),
            });
        }

        let composed = format!("{registry}/{name}");
        let parsed = parse_reference(name, &composed)?;
        Ok(RepositoryRef {
            registry: registry.clone(),
            repository: parsed.repository().to_string(),
        })
    }

    pub fn registry(&self) -> &RegistryEndpoint {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    Tag(String),
    Digest(String),
}

/// A fully qualified image reference: registry, repository, and exactly
/// one of tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    repository: RepositoryRef,
    qualifier: Qualifier,
}

impl ImageReference {
    /// Resolves `name`, `name:tag` or `name@digest` against `registry`.
    pub fn parse(registry: &RegistryEndpoint, name: &str) -> Result<Self, RegmanError> {
        if name.is_empty() {
            return Err(RegmanError::ReferenceParse {
                input: name.to_string(),
                reason: "image name is empty".to_string(),
            });
        }

        let is_digest = name.contains('@');
        let normalized = normalize_name(name);
        let composed = format!("{registry}/{normalized}");
        let parsed = parse_reference(name, &composed)?;

        let qualifier = if is_digest {
            let digest = parsed.digest().ok_or_else(|| RegmanError::ReferenceParse {
                input: name.to_string(),
                reason: "missing digest after '@'".to_string(),
            })?;
            Qualifier::Digest(digest.to_string())
        } else {
            Qualifier::Tag(parsed.tag().unwrap_or(DEFAULT_TAG).to_string())
        };

        Ok(ImageReference {
            repository: RepositoryRef {
                registry: registry.clone(),
                repository: parsed.repository().to_string(),
            },
            qualifier,
        })
    }

    /// Builds `repository@digest`, the only form a delete may be issued
    /// against.
    pub fn with_digest(repository: &RepositoryRef, digest: &str) -> Result<Self, RegmanError> {
        let composed = format!("{repository}@{digest}");
        let parsed = parse_reference(digest, &composed)?;
        let digest = parsed.digest().ok_or_else(|| RegmanError::ReferenceParse {
            input: digest.to_string(),
            reason: "not a digest".to_string(),
        })?;

        Ok(ImageReference {
            repository: repository.clone(),
            qualifier: Qualifier::Digest(digest.to_string()),
        })
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    /// The tag or digest as it appears in a manifest URL.
    pub fn qualifier_str(&self) -> &str {
        match &self.qualifier {
            Qualifier::Tag(tag) => tag,
            Qualifier::Digest(digest) => digest,
        }
    }

    pub fn digest(&self) -> Option<&str> {
        match &self.qualifier {
            Qualifier::Digest(digest) => Some(digest),
            Qualifier::Tag(_) => None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Qualifier::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Qualifier::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}
