use super::{CallConfig, RegistryApi};
use crate::auth::CredentialResolver;
use crate::config::Settings;
use crate::error::RegmanError;
use crate::reference::{ImageReference, RegistryEndpoint, RepositoryRef};

/// Outcome of a successful two-phase delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    /// The reference as the user gave it, normalized.
    pub requested: ImageReference,
    /// `repository@digest` the delete was issued against.
    pub deleted: ImageReference,
}

impl Deletion {
    pub fn digest(&self) -> &str {
        self.deleted.digest().unwrap_or_default()
    }
}

/// Runs registry operations for one invocation. The endpoint and
/// [`CallConfig`] are fixed at construction and shared by every call.
pub struct Dispatcher<R> {
    api: R,
    registry: RegistryEndpoint,
    call: CallConfig,
}

impl<R: RegistryApi> Dispatcher<R> {
    pub fn new(api: R, settings: &Settings) -> Result<Self, RegmanError> {
        Self::with_resolver(api, settings, &CredentialResolver::default())
    }

    /// Fails with [`RegmanError::Configuration`] when no registry is
    /// configured, before any network call.
    pub fn with_resolver(
        api: R,
        settings: &Settings,
        resolver: &CredentialResolver,
    ) -> Result<Self, RegmanError> {
        let registry = RegistryEndpoint::from_config(settings.registry.as_deref())?;
        let call = CallConfig::new(settings, &registry, resolver);
        Ok(Dispatcher {
            api,
            registry,
            call,
        })
    }

    pub fn registry(&self) -> &RegistryEndpoint {
        &self.registry
    }

    pub fn call_config(&self) -> &CallConfig {
        &self.call
    }

    pub fn api(&self) -> &R {
        &self.api
    }

    pub async fn catalog(&self) -> Result<Vec<String>, RegmanError> {
        self.api.list_repositories(&self.registry, &self.call).await
    }

    pub async fn tags(&self, name: &str) -> Result<Vec<String>, RegmanError> {
        let repository = RepositoryRef::parse(&self.registry, name)?;
        self.api.list_tags(&repository, &self.call).await
    }

    /// Deletes `name` (`repo`, `repo:tag` or `repo@digest`).
    ///
    /// The reference is always resolved to a digest first and the delete is
    /// issued against `repository@digest` only, even when the user already
    /// supplied a digest. A lookup failure means no delete is attempted; a
    /// failure of the delete itself is reported as
    /// [`RegmanError::DeleteFailed`].
    pub async fn delete(&self, name: &str) -> Result<Deletion, RegmanError> {
        let requested = ImageReference::parse(&self.registry, name)?;

        let digest = self.api.head_reference(&requested, &self.call).await?;
        log::debug!("Resolved {requested} to {digest}");

        let deleted = ImageReference::with_digest(requested.repository(), &digest)?;
        self.api
            .delete_reference(&deleted, &self.call)
            .await
            .map_err(|e| RegmanError::DeleteFailed {
                digest_reference: deleted.to_string(),
                source: Box::new(e),
            })?;
        log::debug!("Deleted {deleted}");

        Ok(Deletion { requested, deleted })
    }
}
