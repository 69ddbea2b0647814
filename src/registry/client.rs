use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use oci_spec::image::MediaType;
use reqwest::header::{ACCEPT, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{CallConfig, RegistryApi};
use crate::auth::Credentials;
use crate::auth::keychain::{CredentialStore, DefaultKeychain};
use crate::error::{RegmanError, RequestContext, check_response, classify};
use crate::reference::{ImageReference, RegistryEndpoint, RepositoryRef};
use crate::transport::TransportPolicy;

const DIGEST_HEADER: &str = "Docker-Content-Digest";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const CATALOG_SCOPE: &str = "registry:catalog:*";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

/// Parse WWW-Authenticate header
/// Format: Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:user/image:pull"
fn parse_www_authenticate(header: &str) -> Result<Challenge, String> {
    let (scheme, params_str) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Ok(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(format!("unsupported authentication scheme '{scheme}'"));
    }

    // Parse key="value" pairs; quoted values may contain commas (scopes do).
    let mut params: HashMap<String, String> = HashMap::new();
    let mut rest = params_str.trim();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => quoted.split_once('"').unwrap_or((quoted, "")),
            None => after.split_once(',').unwrap_or((after, "")),
        };
        params.insert(key, value.to_string());
        rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    let realm = params
        .remove("realm")
        .ok_or_else(|| "no realm found in WWW-Authenticate header".to_string())?;

    Ok(Challenge::Bearer {
        realm,
        service: params.remove("service"),
    })
}

fn pull_scope(repository: &RepositoryRef) -> String {
    format!("repository:{}:pull", repository.repository())
}

fn delete_scope(repository: &RepositoryRef) -> String {
    format!("repository:{}:*", repository.repository())
}

fn manifest_accept() -> String {
    [
        MediaType::ImageManifest.to_string(),
        MediaType::ImageIndex.to_string(),
        DOCKER_MANIFEST.to_string(),
        DOCKER_MANIFEST_LIST.to_string(),
    ]
    .join(", ")
}

/// Digest from the `Docker-Content-Digest` header or, failing that, the
/// SHA-256 of the manifest body.
fn digest_header_value(headers: &HeaderMap, body: Option<&[u8]>) -> Option<String> {
    match headers.get(DIGEST_HEADER) {
        Some(value) => value.to_str().ok().map(|s| s.trim().to_string()),
        None => body.map(|body| format!("sha256:{:x}", Sha256::digest(body))),
    }
}

#[derive(Debug)]
enum Authorization {
    Anonymous,
    Basic(Credentials),
    Bearer(String),
}

/// A connection to one registry with a resolved scheme and authorization.
struct Session {
    client: Client,
    base_url: String,
    registry: String,
    authorization: Authorization,
}

impl Session {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.authorization {
            Authorization::Anonymous => request,
            Authorization::Basic(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            Authorization::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RegmanError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RegmanError::transport(&self.registry, &e))
    }
}

/// Outcome of pinging `/v2/`: the scheme the registry answered on and the
/// challenge it sent, if any. Independent of credentials.
#[derive(Debug, Clone)]
struct Probe {
    client: Client,
    base_url: String,
    challenge: Option<Challenge>,
}

type ProbeKey = (String, TransportPolicy);

/// [`RegistryApi`] over the OCI distribution HTTP API.
pub struct HttpRegistry {
    store: Box<dyn CredentialStore>,
    probes: Mutex<HashMap<ProbeKey, Probe>>,
}

impl HttpRegistry {
    pub fn new(store: Box<dyn CredentialStore>) -> Self {
        HttpRegistry {
            store,
            probes: Mutex::new(HashMap::new()),
        }
    }

    /// Checks that the registry accepts the configured credentials, the
    /// way `docker login` does.
    pub async fn authenticate(
        &self,
        registry: &RegistryEndpoint,
        call: &CallConfig,
    ) -> Result<(), RegmanError> {
        let session = self.open_session(registry, call, None).await?;
        let ctx = RequestContext {
            registry: registry.as_str(),
            operation: "log in",
            target: None,
        };
        let response = session.send(session.client.get(session.url("/v2/"))).await?;
        check_response(response, ctx).await?;
        Ok(())
    }

    /// Pings the registry once per endpoint and transport policy; later
    /// calls reuse the scheme and challenge from the first ping.
    async fn probe(
        &self,
        registry: &RegistryEndpoint,
        transport: TransportPolicy,
    ) -> Result<Probe, RegmanError> {
        let key = (registry.as_str().to_string(), transport);
        let cached = self
            .probes
            .lock()
            .ok()
            .and_then(|probes| probes.get(&key).cloned());
        if let Some(probe) = cached {
            return Ok(probe);
        }

        let client = transport
            .http_client()
            .map_err(|e| RegmanError::transport(registry.as_str(), &e))?;

        let host = registry.api_host();
        let mut ping = None;
        let mut last_error = None;
        for scheme in transport.schemes() {
            let base_url = format!("{scheme}://{host}");
            log::debug!("Checking registry endpoint: {base_url}/v2/");
            match client.get(format!("{base_url}/v2/")).send().await {
                Ok(response) => {
                    ping = Some((base_url, response));
                    break;
                }
                Err(e) => {
                    log::debug!("Ping of {base_url} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        let (base_url, response) = match (ping, last_error) {
            (Some(ping), _) => ping,
            (None, Some(e)) => return Err(RegmanError::transport(registry.as_str(), &e)),
            (None, None) => {
                return Err(RegmanError::Transport {
                    registry: registry.to_string(),
                    message: "no scheme to connect with".to_string(),
                });
            }
        };

        let challenge = match response.status() {
            status if status.is_success() => {
                log::debug!("Registry allows anonymous access");
                None
            }
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| RegmanError::Authentication {
                        registry: registry.to_string(),
                        message: "no WWW-Authenticate header in registry response".to_string(),
                    })?;
                log::debug!("WWW-Authenticate header: {header}");

                let challenge =
                    parse_www_authenticate(header).map_err(|message| {
                        RegmanError::Authentication {
                            registry: registry.to_string(),
                            message,
                        }
                    })?;
                Some(challenge)
            }
            status => {
                let ctx = RequestContext {
                    registry: registry.as_str(),
                    operation: "contact registry",
                    target: None,
                };
                let body = response.text().await.unwrap_or_default();
                log::debug!("Ping failed with {status}: {body}");
                return Err(classify(status, &body, ctx));
            }
        };

        let probe = Probe {
            client,
            base_url,
            challenge,
        };
        if let Ok(mut probes) = self.probes.lock() {
            probes.insert(key, probe.clone());
        }
        Ok(probe)
    }

    /// Negotiates authorization for `scope` on top of the registry probe.
    ///
    /// Resolved credentials are always sent: as Basic auth unless the
    /// registry asks for a Bearer token, in which case they are exchanged
    /// for one. A registry that answers the ping anonymously may still
    /// require them for writes.
    async fn open_session(
        &self,
        registry: &RegistryEndpoint,
        call: &CallConfig,
        scope: Option<&str>,
    ) -> Result<Session, RegmanError> {
        let probe = self.probe(registry, call.transport).await?;
        let credentials = call.credentials.credentials(self.store.as_ref())?;

        let authorization = match (probe.challenge, credentials) {
            (Some(Challenge::Bearer { realm, service }), credentials) => {
                let token = self
                    .fetch_token(
                        &probe.client,
                        registry,
                        &realm,
                        service.as_deref(),
                        scope,
                        credentials.as_ref(),
                    )
                    .await?;
                Authorization::Bearer(token)
            }
            (_, Some(credentials)) => Authorization::Basic(credentials),
            (_, None) => Authorization::Anonymous,
        };

        Ok(Session {
            client: probe.client,
            base_url: probe.base_url,
            registry: registry.to_string(),
            authorization,
        })
    }

    async fn fetch_token(
        &self,
        client: &Client,
        registry: &RegistryEndpoint,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<String, RegmanError> {
        let mut query = Vec::new();
        if let Some(service) = service {
            query.push(("service", service));
        }
        if let Some(scope) = scope {
            query.push(("scope", scope));
        }
        log::debug!("Requesting token from {realm} with {query:?}");

        let mut request = client.get(realm).query(&query);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
            log::debug!("Using basic auth with username: {}", credentials.username);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegmanError::transport(registry.as_str(), &e))?;
        let ctx = RequestContext {
            registry: registry.as_str(),
            operation: "fetch registry token",
            target: None,
        };
        let response = check_response(response, ctx).await.map_err(|e| match e {
            RegmanError::Registry { message, .. } => RegmanError::Authentication {
                registry: registry.to_string(),
                message,
            },
            other => other,
        })?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegmanError::transport(registry.as_str(), &e))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegmanError::Authentication {
                registry: registry.to_string(),
                message: "no token in token response".to_string(),
            })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: Response,
        ctx: RequestContext<'_>,
    ) -> Result<T, RegmanError> {
        let status = response.status().as_u16();
        response.json().await.map_err(|e| RegmanError::Registry {
            operation: ctx.operation,
            status,
            message: format!("invalid response body: {e}"),
        })
    }
}

impl Default for HttpRegistry {
    fn default() -> Self {
        HttpRegistry::new(Box::new(DefaultKeychain::default()))
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    async fn list_repositories(
        &self,
        registry: &RegistryEndpoint,
        call: &CallConfig,
    ) -> Result<Vec<String>, RegmanError> {
        let session = self.open_session(registry, call, Some(CATALOG_SCOPE)).await?;
        let ctx = RequestContext {
            registry: registry.as_str(),
            operation: "fetch catalog",
            target: None,
        };

        let url = session.url("/v2/_catalog");
        log::debug!("Fetching catalog from {url}");
        let response = session.send(session.client.get(&url)).await?;
        let response = check_response(response, ctx).await?;
        let catalog: CatalogResponse = Self::decode(response, ctx).await?;
        Ok(catalog.repositories.unwrap_or_default())
    }

    async fn list_tags(
        &self,
        repository: &RepositoryRef,
        call: &CallConfig,
    ) -> Result<Vec<String>, RegmanError> {
        let scope = pull_scope(repository);
        let session = self
            .open_session(repository.registry(), call, Some(&scope))
            .await?;
        let target = repository.to_string();
        let ctx = RequestContext {
            registry: repository.registry().as_str(),
            operation: "list tags",
            target: Some(&target),
        };

        let url = session.url(&format!("/v2/{}/tags/list", repository.repository()));
        log::debug!("Listing tags from {url}");
        let response = session.send(session.client.get(&url)).await?;
        let response = check_response(response, ctx).await?;
        let tags: TagsResponse = Self::decode(response, ctx).await?;
        Ok(tags.tags.unwrap_or_default())
    }

    async fn head_reference(
        &self,
        reference: &ImageReference,
        call: &CallConfig,
    ) -> Result<String, RegmanError> {
        let repository = reference.repository();
        let scope = pull_scope(repository);
        let session = self
            .open_session(repository.registry(), call, Some(&scope))
            .await?;
        let target = reference.to_string();
        let ctx = RequestContext {
            registry: repository.registry().as_str(),
            operation: "look up manifest",
            target: Some(&target),
        };

        let url = session.url(&format!(
            "/v2/{}/manifests/{}",
            repository.repository(),
            reference.qualifier_str()
        ));
        let accept = manifest_accept();

        log::debug!("HEAD image manifest from {url}");
        let response = session
            .send(session.client.head(&url).header(ACCEPT, &accept))
            .await?;
        let response = check_response(response, ctx).await?;
        if let Some(digest) = digest_header_value(response.headers(), None) {
            return Ok(digest);
        }

        log::debug!("No {DIGEST_HEADER} header, GET image manifest from {url}");
        let response = session
            .send(session.client.get(&url).header(ACCEPT, &accept))
            .await?;
        let response = check_response(response, ctx).await?;
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| RegmanError::transport(repository.registry().as_str(), &e))?;
        digest_header_value(&headers, Some(&body[..])).ok_or_else(|| RegmanError::Registry {
            operation: ctx.operation,
            status: 200,
            message: format!("invalid {DIGEST_HEADER} header"),
        })
    }

    async fn delete_reference(
        &self,
        reference: &ImageReference,
        call: &CallConfig,
    ) -> Result<(), RegmanError> {
        let digest = reference.digest().ok_or_else(|| RegmanError::ReferenceParse {
            input: reference.to_string(),
            reason: "deletes must address a digest".to_string(),
        })?;
        let repository = reference.repository();
        let scope = delete_scope(repository);
        let session = self
            .open_session(repository.registry(), call, Some(&scope))
            .await?;
        let target = reference.to_string();
        let ctx = RequestContext {
            registry: repository.registry().as_str(),
            operation: "delete manifest",
            target: Some(&target),
        };

        let url = session.url(&format!(
            "/v2/{}/manifests/{}",
            repository.repository(),
            digest
        ));
        log::debug!("DELETE image manifest at {url}");
        let response = session.send(session.client.delete(&url)).await?;
        check_response(response, ctx).await?;
        Ok(())
    }
}
