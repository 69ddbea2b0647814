use std::io::{self, Read};

use anyhow::Result;
use console::{Emoji, style};
use yapp::PasswordReader;

use super::{CallConfig, HttpRegistry};
use crate::auth::keychain::KeyringStore;
use crate::auth::{CredentialSet, Credentials};
use crate::config::Settings;
use crate::default_spinner;
use crate::reference::RegistryEndpoint;
use crate::transport::TransportPolicy;

static LOCK: Emoji = Emoji("🔒 ", "");

pub async fn login(settings: &Settings, args: &clap::ArgMatches) -> Result<()> {
    let registry = RegistryEndpoint::from_config(settings.registry.as_deref())?;
    if settings.user.is_empty() {
        return Err(anyhow::anyhow!(
            "username is required (via --user, REGMAN_USER env, or config file)"
        ));
    }

    let password = if args.get_flag("password_stdin") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to read password from stdin: {}", e))?;
        buffer.trim().to_string()
    } else if !settings.pass.is_empty() {
        settings.pass.clone()
    } else {
        let mut yapp = yapp::Yapp::new().with_echo_symbol('*');
        yapp.read_password_with_prompt("Enter password: ")
            .map_err(|e| anyhow::anyhow!("Failed to read password from stdin: {}", e))?
    };

    let credentials = Credentials {
        username: settings.user.clone(),
        password,
    };
    let call = CallConfig {
        credentials: CredentialSet::Explicit(credentials.clone()),
        transport: TransportPolicy::from_insecure(settings.insecure),
    };

    let spinner = default_spinner();
    spinner.set_prefix("Logging in...");
    spinner.set_message(registry.to_string());
    let verified = HttpRegistry::default().authenticate(&registry, &call).await;
    spinner.finish_and_clear();
    verified?;

    KeyringStore::new().save(registry.as_str(), &credentials)?;
    println!(
        "{}Logged in to {} as {}",
        LOCK,
        style(&registry).cyan(),
        style(&credentials.username).green()
    );
    Ok(())
}

pub fn logout(settings: &Settings) -> Result<()> {
    let registry = RegistryEndpoint::from_config(settings.registry.as_deref())?;
    if KeyringStore::new().delete(registry.as_str())? {
        println!("Removed saved credentials for {}", style(&registry).cyan());
    } else {
        println!(
            "{} No saved credentials for {}",
            style("ℹ️").dim(),
            style(&registry).cyan()
        );
    }
    Ok(())
}
