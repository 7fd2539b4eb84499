//! Command-line argument definitions.
//!
//! Uses clap's derive API for declarative argument parsing with
//! support for subcommands and global options.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A CLI tool to scrub privacy-sensitive metadata from files.
///
/// Rebuilds archives with normalized envelopes, recurses into nested
/// containers, and filters metadata out of supported leaf formats.
#[derive(Debug, Parser)]
#[command(
    name = "metascrub",
    author,
    version,
    about = "Scrub metadata from files before publishing them",
    long_about = "Scrub privacy-sensitive metadata from files before publishing them.\n\n\
                  Supported containers (ZIP, tar, tar.gz, tar.bz2, OpenDocument,\n\
                  Office OpenXML) are rebuilt entry by entry with normalized\n\
                  envelopes: entry dates pinned to the ZIP epoch, ownership\n\
                  zeroed, comments removed. Recognized entries are recursively\n\
                  sanitized; PNG and JPEG images lose their metadata chunks\n\
                  and segments.\n\n\
                  The sanitized file atomically replaces the original.",
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Global options that apply to all commands
    #[command(flatten)]
    pub global: GlobalOptions,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Global options available for all commands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Keep the original next to the sanitized file as <name>.bak
    #[arg(short = 'b', long, global = true)]
    pub backup: bool,

    /// Keep archive entries of unsupported format instead of dropping them
    #[arg(short = 'a', long, global = true)]
    pub add2archive: bool,

    /// Skip confirmation prompts
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands for the CLI.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scrub metadata from the given files, replacing them in place
    #[command(visible_alias = "s")]
    Scrub {
        /// Files to sanitize
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Check whether the given files are clean of harmful metadata
    #[command(visible_alias = "c")]
    Check {
        /// Files to check
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Display the metadata found in the given files
    #[command(visible_alias = "i")]
    Info {
        /// Files to inspect
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// List the supported formats
    #[command(visible_alias = "l")]
    Formats,
}
