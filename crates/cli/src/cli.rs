use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Host tooling for DEFEX rule blobs.
///
/// Compiles rule source text into the packed binary format, signs it, and
/// inspects or queries the result.
#[derive(Parser, Debug)]
#[command(name = "defex", version, about = "Compile, sign and query DEFEX rule blobs")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile rule source text into a blob.
    Compile {
        /// Rule source (`features path [sha256]` per line)
        input: PathBuf,

        /// Output blob
        #[arg(short, long)]
        output: PathBuf,

        /// Hex Ed25519 secret key; signs the blob when set
        #[arg(long, env = "DEFEX_SIGNING_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// Append an Ed25519 signature to an unsigned blob.
    Sign {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Hex Ed25519 secret key
        #[arg(long, env = "DEFEX_SIGNING_KEY", hide_env_values = true)]
        key: String,
    },

    /// Validate a blob and list its nodes.
    Inspect {
        input: PathBuf,

        /// Emit JSON instead of rule source lines
        #[arg(long)]
        json: bool,
    },

    /// Evaluate one query against a blob.
    Lookup {
        input: PathBuf,

        /// Absolute path to look up
        path: String,

        /// Requested features, `|`-separated
        features: String,

        /// File whose content is hashed for integrity-checked rules
        #[arg(long)]
        file: Option<PathBuf>,

        /// Evaluate as a recovery boot
        #[arg(long)]
        recovery: bool,

        /// Strip a leading `/system_root` from the path
        #[arg(long)]
        system_root: bool,
    },

    /// Boot the engine from the environment and print its status.
    Status {
        /// Config profile, overriding `DEFEX_PROFILE`
        #[arg(long)]
        profile: Option<String>,
    },
}
