//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the dispatch server.
///
/// Arguments override configuration file settings; environment variables
/// sit between the two (file < env < flags).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Server listen address (e.g. "0.0.0.0:8080" or ":8080")
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            debug: false,
        }
    }
}
