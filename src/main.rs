//! dapsession - interactive debugger speaking the Debug Adapter Protocol

use clap::Parser;
use dapsession::commands::Cli;
use dapsession::{cli, common::logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Held until exit so the file writer flushes
    let _log_guard = if cli.log_file {
        logging::init_with_file().map(|(path, guard)| {
            eprintln!("Logging to {}", path.display());
            guard
        })
    } else {
        logging::init_cli();
        None
    };

    if let Err(e) = cli::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
