//! defex-worker: long-running policy engine fed over stdin.
//!
//! Boots a [`PolicyEngine`] from the environment, then answers one query per
//! input line and prints one JSON decision per output line:
//!
//! ```text
//! <features> <path> [file-to-hash]
//! status
//! ```
//!
//! End of input stops late loading and exits.

use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use defex_core::config::load_dotenv;
use defex_core::{Config, StaticBootState};
use defex_rules::loader::{self, FsOpener};
use defex_rules::{Features, PolicyEngine};

// ── CLI ─────────────────────────────────────────────────────────────

/// Policy lookup worker reading queries from stdin.
#[derive(Parser, Debug)]
#[command(name = "defex-worker", version, about)]
struct Cli {
    /// Config profile, overriding `DEFEX_PROFILE`.
    #[arg(long)]
    profile: Option<String>,

    /// Print the effective config and exit.
    #[arg(long)]
    print_config: bool,
}

// ── Query handling ──────────────────────────────────────────────────

fn answer(engine: &PolicyEngine, line: &str) -> serde_json::Value {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        ["status"] => json!({ "status": engine.status() }),
        [features, path, rest @ ..] if rest.len() <= 1 => {
            let Some(attribute) = Features::parse_list(features) else {
                return json!({ "error": format!("unknown feature in '{}'", features) });
            };
            let mut file = match rest.first().map(File::open).transpose() {
                Ok(file) => file,
                Err(e) => return json!({ "error": format!("cannot open file: {}", e) }),
            };
            let decision = engine.rules_lookup(
                path,
                attribute,
                file.as_mut().map(|f| f as &mut dyn Read),
            );
            json!({ "path": path, "attribute": attribute.names(), "result": decision })
        }
        _ => json!({ "error": "expected '<features> <path> [file]' or 'status'" }),
    }
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = match &cli.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.summary())?);
        return Ok(());
    }
    config.log_summary();

    let boot = StaticBootState::from_env(&config.profile);
    let verifier = loader::from_config(&config.signature).context("invalid signature config")?;
    let engine = PolicyEngine::boot(&config, Arc::new(boot), verifier, Arc::new(FsOpener))
        .context("failed to load boot rules")?;
    info!(phase = ?engine.phase(), "defex-worker ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read query")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let reply = answer(&engine, line);
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }

    match engine.shutdown() {
        Some(reason) => info!(?reason, "late loading stopped"),
        None => warn!("late loading was not running"),
    }
    Ok(())
}
