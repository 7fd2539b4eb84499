//! metascrub - scrub privacy-sensitive metadata from files.
//!
//! Rebuilds archives with normalized envelopes and recursively sanitizes
//! everything it recognizes inside them.
//!
//! # Usage
//!
//! ```bash
//! # Sanitize files in place
//! metascrub scrub report.docx photos.tar.gz
//!
//! # Keep a backup copy of each original
//! metascrub scrub --backup report.docx
//!
//! # Check whether files are clean
//! metascrub check archive.zip
//!
//! # Show the metadata a file carries
//! metascrub info photo.jpg
//!
//! # List supported formats
//! metascrub formats
//! ```

mod cli;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Runner};

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Route diagnostics to stderr; --verbose lowers the filter to debug
    let default_filter = if cli.global.verbose { "metascrub=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Create and run the command runner
    let runner = Runner::new(cli);

    if let Err(e) = runner.run() {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
