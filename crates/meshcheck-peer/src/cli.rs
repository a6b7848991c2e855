use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "meshcheck-peer", about = "Standalone emulated Matrix federation peer")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/meshcheck.toml")]
    pub config: PathBuf,

    /// File holding the base64 ed25519 seed to sign with (generated if omitted)
    #[arg(long)]
    pub signing_key: Option<PathBuf>,

    /// Create a public room of this version at startup
    #[arg(long)]
    pub room_version: Option<String>,

    /// Answer unmatched requests with 200 instead of recording them
    #[arg(long)]
    pub lenient: bool,
}
