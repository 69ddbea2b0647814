use anyhow::Result;
use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};

use crate::auth::{CredentialResolver, CredentialSet};
use crate::config::Settings;
use crate::error::RegmanError;
use crate::reference::{ImageReference, RegistryEndpoint, RepositoryRef};
use crate::transport::TransportPolicy;

pub mod client;
mod delete;
pub mod dispatch;
mod list;
mod login;

pub use client::HttpRegistry;
pub use dispatch::{Deletion, Dispatcher};

/// Options shared by every registry call of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub credentials: CredentialSet,
    pub transport: TransportPolicy,
}

impl CallConfig {
    pub fn new(
        settings: &Settings,
        registry: &RegistryEndpoint,
        resolver: &CredentialResolver,
    ) -> Self {
        CallConfig {
            credentials: resolver.resolve(settings, registry),
            transport: TransportPolicy::from_insecure(settings.insecure),
        }
    }
}

/// The registry calls regman needs. Each method is a single logical call.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn list_repositories(
        &self,
        registry: &RegistryEndpoint,
        call: &CallConfig,
    ) -> Result<Vec<String>, RegmanError>;

    async fn list_tags(
        &self,
        repository: &RepositoryRef,
        call: &CallConfig,
    ) -> Result<Vec<String>, RegmanError>;

    /// Metadata-only lookup returning the manifest digest.
    async fn head_reference(
        &self,
        reference: &ImageReference,
        call: &CallConfig,
    ) -> Result<String, RegmanError>;

    /// `reference` is always digest-qualified.
    async fn delete_reference(
        &self,
        reference: &ImageReference,
        call: &CallConfig,
    ) -> Result<(), RegmanError>;
}

pub fn commands() -> Vec<Command> {
    vec![
        Command::new("ls").about("List repositories"),
        Command::new("tags")
            .about("List tags for a specific image")
            .arg_required_else_help(true)
            .arg(
                Arg::new("image_name")
                    .help("Repository to list tags for (e.g., 'team/app')")
                    .required(true)
                    .index(1),
            ),
        Command::new("rm")
            .about("Delete a specific tag or image by digest")
            .arg_required_else_help(true)
            .arg(
                Arg::new("image_name")
                    .value_name("IMAGE_NAME[:TAG|@DIGEST]")
                    .help("Image to delete; the tag defaults to 'latest'")
                    .required(true)
                    .index(1),
            ),
        Command::new("login")
            .about("Verify credentials and save them in the system keychain")
            .arg(
                Arg::new("password_stdin")
                    .long("password-stdin")
                    .help("Read password from stdin")
                    .action(ArgAction::SetTrue),
            ),
        Command::new("logout").about("Remove saved credentials for the registry"),
    ]
}

pub async fn handle(settings: &Settings, matches: &clap::ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("ls", _)) => {
            let dispatcher = Dispatcher::new(HttpRegistry::default(), settings)?;
            list::list_repositories(&dispatcher).await
        }
        Some(("tags", args)) => {
            let dispatcher = Dispatcher::new(HttpRegistry::default(), settings)?;
            list::list_tags(&dispatcher, args).await
        }
        Some(("rm", args)) => {
            let dispatcher = Dispatcher::new(HttpRegistry::default(), settings)?;
            delete::delete_image(&dispatcher, args).await
        }
        Some(("login", args)) => login::login(settings, args).await,
        Some(("logout", _)) => login::logout(settings),
        Some((other, _)) => Err(anyhow::anyhow!("Unknown command '{other}'")),
        None => Err(anyhow::anyhow!("No command given")),
    }
}
