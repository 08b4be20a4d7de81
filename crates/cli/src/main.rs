mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::cli::{CliArgs, Command};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    defex_core::config::load_dotenv();
    let args = CliArgs::parse();

    match args.command {
        Command::Compile { input, output, key } => commands::compile(&input, &output, key.as_deref()),
        Command::Sign { input, output, key } => commands::sign(&input, &output, &key),
        Command::Inspect { input, json } => commands::inspect(&input, json),
        Command::Lookup {
            input,
            path,
            features,
            file,
            recovery,
            system_root,
        } => commands::lookup(&input, &path, &features, file.as_deref(), recovery, system_root),
        Command::Status { profile } => commands::status(profile.as_deref()),
    }
}
