use anyhow::Result;
use console::{Emoji, style};

use super::{Dispatcher, RegistryApi};
use crate::default_spinner;

static DELETE: Emoji = Emoji("🗑️ ", "");
static DIGEST: Emoji = Emoji("🔎 ", "");

pub async fn delete_image<R: RegistryApi>(
    dispatcher: &Dispatcher<R>,
    args: &clap::ArgMatches,
) -> Result<()> {
    let name = args
        .get_one::<String>("image_name")
        .expect("Image name is required");

    let progress = default_spinner();
    progress.set_prefix("Deleting image...");
    progress.set_message(format!("{}/{}", dispatcher.registry(), name));

    let deletion = dispatcher.delete(name).await;
    progress.finish_and_clear();
    let deletion = deletion?;

    println!(
        "{}Found digest: {} for {}",
        DIGEST,
        style(deletion.digest()).yellow(),
        deletion.requested
    );
    println!(
        "{}Deleted {}",
        DELETE,
        style(&deletion.deleted).cyan()
    );
    println!("{}", style("Successfully deleted.").green());

    Ok(())
}
