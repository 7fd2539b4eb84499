//! Command runner that executes CLI commands.
//!
//! This module bridges the CLI arguments with the sanitizer core,
//! providing user-friendly output and progress indication.

use std::fs;
use std::path::Path;

use colored::Colorize;
use console::Term;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};

use metascrub::core::{create_stripper, list_supported_formats, StripOptions};

use super::args::{Cli, Commands};

/// The command runner that executes CLI commands.
pub struct Runner {
    cli: Cli,
    #[allow(dead_code)]
    term: Term,
}

/// Outcome counters for a multi-file run.
#[derive(Debug, Default)]
struct Summary {
    total: usize,
    processed: usize,
    skipped: usize,
    failed: usize,
}

impl Summary {
    fn is_complete_success(&self) -> bool {
        self.failed == 0
    }
}

impl Runner {
    /// Creates a new runner with the parsed CLI arguments.
    pub fn new(cli: Cli) -> Self {
        Self {
            cli,
            term: Term::stderr(),
        }
    }

    /// Runs the appropriate command based on CLI arguments.
    pub fn run(&self) -> anyhow::Result<()> {
        match &self.cli.command {
            Commands::Scrub { files } => self.run_scrub(files),
            Commands::Check { files } => self.run_check(files),
            Commands::Info { files } => self.run_info(files),
            Commands::Formats => self.run_formats(),
        }
    }

    /// Builds the options record handed to the factory.
    fn options(&self) -> StripOptions {
        StripOptions::default()
            .with_backup(self.cli.global.backup)
            .with_add2archive(self.cli.global.add2archive)
    }

    /// Sanitizes the given files in place.
    fn run_scrub(&self, files: &[std::path::PathBuf]) -> anyhow::Result<()> {
        self.print_header("Scrub Metadata");

        for file in files {
            if !file.exists() {
                anyhow::bail!("Path does not exist: {}", file.display());
            }
        }

        if !self.cli.global.backup {
            println!(
                "{}",
                "Originals will be overwritten (use --backup to keep a copy).".yellow()
            );
        }
        if !self.confirm_action(&format!(
            "Scrub metadata from {} file(s)?",
            files.len()
        ))? {
            println!("{}", "Operation cancelled.".yellow());
            return Ok(());
        }

        let options = self.options();
        let progress = (files.len() > 1).then(|| self.create_progress_bar(files.len() as u64));
        let mut summary = Summary::default();

        for file in files {
            if let Some(bar) = &progress {
                bar.set_message(
                    file.file_name()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .into_owned(),
                );
            }
            summary.total += 1;
            match create_stripper(file, is_writable(file), &options) {
                Some(mut stripper) => {
                    if stripper.remove_all() {
                        summary.processed += 1;
                        self.progress_line(
                            &progress,
                            format!("{} {}", "✓".green().bold(), file.display()),
                        );
                    } else {
                        summary.failed += 1;
                        self.progress_line(
                            &progress,
                            format!(
                                "{} {} - could not be sanitized",
                                "✗".red().bold(),
                                file.display()
                            ),
                        );
                    }
                }
                None => {
                    summary.skipped += 1;
                    self.progress_line(
                        &progress,
                        format!(
                            "{} {} - format not supported or harmless, skipped",
                            "-".yellow().bold(),
                            file.display()
                        ),
                    );
                }
            }
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }

        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        self.print_report(&summary);

        if summary.is_complete_success() {
            Ok(())
        } else {
            anyhow::bail!("{} file(s) could not be sanitized", summary.failed)
        }
    }

    /// Reports whether each file is clean.
    fn run_check(&self, files: &[std::path::PathBuf]) -> anyhow::Result<()> {
        self.print_header("Check Cleanliness");

        let options = self.options();
        let mut dirty = 0usize;
        for file in files {
            match create_stripper(file, false, &options) {
                Some(mut stripper) => {
                    if stripper.is_clean() {
                        println!("{} {} is clean", "✓".green().bold(), file.display());
                    } else {
                        dirty += 1;
                        println!("{} {} is not clean", "✗".red().bold(), file.display());
                    }
                    if self.cli.global.verbose {
                        for entry in stripper.is_clean_listing() {
                            println!("    {} {}", "unsupported entry:".dimmed(), entry);
                        }
                    }
                }
                None => {
                    println!(
                        "{} {} - format not supported or harmless",
                        "-".yellow().bold(),
                        file.display()
                    );
                }
            }
        }

        if dirty == 0 {
            Ok(())
        } else {
            anyhow::bail!("{dirty} file(s) carry harmful metadata")
        }
    }

    /// Displays the metadata found in each file.
    fn run_info(&self, files: &[std::path::PathBuf]) -> anyhow::Result<()> {
        self.print_header("File Metadata");

        let options = self.options();
        for file in files {
            println!("{} {}", "File:".cyan(), file.display());
            match create_stripper(file, false, &options) {
                Some(mut stripper) => {
                    let metadata = stripper.get_meta();
                    if metadata.is_empty() {
                        println!("  {}", "No harmful metadata found".green());
                    } else {
                        for (key, value) in metadata {
                            println!("  {} {}", format!("{key}:").bold(), value);
                        }
                    }
                }
                None => {
                    println!("  {}", "Format not supported or harmless".yellow());
                }
            }
            println!();
        }
        Ok(())
    }

    /// Lists the supported formats.
    fn run_formats(&self) -> anyhow::Result<()> {
        self.print_header("Supported Formats");

        for format in list_supported_formats() {
            println!(
                "  {} ({}) - {}",
                format.mime.bold(),
                format.extension.cyan(),
                format.description
            );
        }
        Ok(())
    }

    /// Confirms an action with the user.
    fn confirm_action(&self, message: &str) -> anyhow::Result<bool> {
        if self.cli.global.yes {
            return Ok(true);
        }

        Ok(Confirm::new()
            .with_prompt(message)
            .default(false)
            .interact()?)
    }

    /// Prints a header for a command.
    fn print_header(&self, title: &str) {
        println!("\n{}", "━".repeat(50).dimmed());
        println!("{} {}", "▶".cyan(), title.bold());
        println!("{}\n", "━".repeat(50).dimmed());
    }

    /// Prints a per-file line, routing around an active progress bar.
    fn progress_line(&self, progress: &Option<ProgressBar>, line: String) {
        match progress {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    /// Prints a summary report.
    fn print_report(&self, summary: &Summary) {
        println!("\n{}", "━".repeat(50).dimmed());
        println!("{}", "Summary".bold());
        println!("{}", "━".repeat(50).dimmed());

        println!("  Total files: {}", summary.total);
        println!("  {} {}", "Sanitized:".green(), summary.processed);
        println!("  Skipped:     {}", summary.skipped);
        if summary.failed > 0 {
            println!("  {} {}", "Failed:".red(), summary.failed);
        } else {
            println!("  Failed:      {}", summary.failed);
        }

        if summary.is_complete_success() {
            println!("\n{}", "All requested files were processed.".green().bold());
        } else {
            println!("\n{}", "Some files could not be sanitized.".yellow());
        }
    }

    /// Creates a progress bar for determinate progress.
    fn create_progress_bar(&self, total: u64) -> ProgressBar {
        let progress = ProgressBar::new(total);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/dim}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("█▓░"),
        );
        progress.enable_steady_tick(std::time::Duration::from_millis(100));
        progress
    }
}

/// Whether the file can be replaced by its sanitized copy.
fn is_writable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| !metadata.permissions().readonly())
        .unwrap_or(false)
}
