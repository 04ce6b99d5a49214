mod changed;
mod cli;
mod command;
mod daemon;
mod errors;
mod logging;
mod notifier;
mod pidfile;
mod profile;
mod profile_manager;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;
use crate::logging::LogOutput;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let output = match &cli.log_file {
        Some(path) => LogOutput::file(path)?,
        None => LogOutput::stderr(),
    };
    logging::init(cli.verbose, output.clone());

    daemon::run(cli, output).await
}
