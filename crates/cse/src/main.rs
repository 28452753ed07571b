use std::io::Write;

use anyhow::Result;
use clap::Parser;
use crossterm::style::Stylize;
use cse::cmd;
use cse::config::cli::Cli;
use cse::config::cli::Commands;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Install(args) => cmd::run_install(args).await,
        Commands::Upgrade(args) => cmd::run_upgrade(args).await,
        Commands::Run(args) => cmd::run_server(args).await,
        Commands::Check(args) => cmd::run_check(args).await,
        Commands::Sample(args) => cmd::run_sample(args),
        Commands::Encrypt(args) => cmd::run_encrypt(args),
        Commands::Decrypt(args) => cmd::run_decrypt(args),
        Commands::Template(command) => cmd::run_template(command).await,
        Commands::CreateServiceRole(args) => cmd::run_create_service_role(args).await,
        Commands::PksConfigure(args) => cmd::run_pks_configure(args).await,
    }
}

/// Commands whose output is the file content itself stay off the disk.
fn writes_to_stdout(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Sample(_) | Commands::Encrypt(_) | Commands::Decrypt(_)
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    let _guard = if writes_to_stdout(&cli.command) {
        logging::init_stderr();
        None
    } else {
        let dir = logging::log_dir(cli.log_dir.as_deref());
        std::fs::create_dir_all(&dir)?;
        Some(logging::init(&dir, "cse")?)
    };
    tracing::debug!("cse {}", &**version::VERSION);

    if let Err(e) = dispatch(cli.command).await {
        tracing::error!("{e:#}");
        let _ = writeln!(std::io::stderr(), "{}", format!("Error: {e:#}").red());
        drop(_guard);
        std::process::exit(1);
    }
    Ok(())
}
