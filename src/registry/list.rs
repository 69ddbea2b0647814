use anyhow::Result;
use console::Emoji;

use super::{Dispatcher, RegistryApi};
use crate::default_spinner;

static LIST: Emoji = Emoji("📋 ", "");

fn print_lines(lines: &[String], empty: &str) {
    if lines.is_empty() {
        eprintln!("{} {}", console::style("ℹ️").dim(), empty);
        return;
    }
    for line in lines {
        println!("{line}");
    }
}

pub async fn list_repositories<R: RegistryApi>(dispatcher: &Dispatcher<R>) -> Result<()> {
    let spinner = default_spinner();
    spinner.set_prefix("Fetching catalog");
    spinner.set_message(format!("{}{}", LIST, dispatcher.registry()));

    let repositories = dispatcher.catalog().await;
    spinner.finish_and_clear();

    print_lines(&repositories?, "No repositories found.");
    Ok(())
}

pub async fn list_tags<R: RegistryApi>(
    dispatcher: &Dispatcher<R>,
    args: &clap::ArgMatches,
) -> Result<()> {
    let name = args
        .get_one::<String>("image_name")
        .expect("Image name is required");

    let spinner = default_spinner();
    spinner.set_prefix("Listing tags");
    spinner.set_message(format!("{}{}/{}", LIST, dispatcher.registry(), name));

    let tags = dispatcher.tags(name).await;
    spinner.finish_and_clear();

    print_lines(&tags?, "No tags found.");
    Ok(())
}
