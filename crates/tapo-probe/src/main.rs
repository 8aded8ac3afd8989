//! Debug utility for a single Tapo smart plug.
//!
//! Connects with the given credentials, prints the device info and one energy
//! reading, and with `-debug` shows the credential hashes the handshake uses.

use clap::Parser;

mod cli;
mod handlers;
mod utils;

use cli::{Cli, normalize_args, usage};

#[tokio::main]
async fn main() {
    let args = normalize_args(std::env::args());
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if cli.help {
        eprintln!("{}", usage());
        std::process::exit(0);
    }

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let args = match cli.into_probe_args() {
        Ok(args) => args,
        Err(flag) => {
            eprintln!("Error: {} is required\n", flag);
            eprintln!("{}", usage());
            std::process::exit(1);
        }
    };

    if let Err(e) = handlers::run_probe(&args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
