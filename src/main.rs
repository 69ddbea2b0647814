use clap::Command;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
    let matches = Command::new("regman")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A simple Docker Registry manager")
        .long_about(
            "A tool for managing private Docker registries. \
             Configurable via flags, ENV (REGMAN_*), or config file (~/.regman.yaml).",
        )
        .subcommand_required(true)
        .args(regman::config::global_args())
        .subcommands(regman::registry::commands())
        .get_matches();

    let r = match regman::config::Settings::load(&matches) {
        Ok(settings) => regman::registry::handle(&settings, &matches).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = r {
        log::debug!("Error: {e:?}");
        eprintln!("{} {}", console::style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
