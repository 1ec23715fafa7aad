//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    #[value(alias = "console")]
    Text,
    /// One JSON object per line.
    Json,
}

/// Stage task inputs in and task outputs out.
///
/// Reads the task manifest, then downloads the declared inputs, uploads the
/// declared outputs, or both, across object storage, HTTP, FTP, DRS and local
/// mounts.
#[derive(Parser, Debug)]
#[command(name = "filer")]
#[command(author, version, about)]
pub struct Args {
    /// Which side to run: inputs, outputs or all (default: $FILER_MODE)
    pub mode: Option<String>,

    /// Manifest file (default: $POD_INFO_ANNOTATIONS_FILE)
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Explicit log filter, e.g. `debug` or `filer_core=trace`
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log line encoding
    #[arg(long, env = "LOG_ENCODING", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Filter directive used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_filter(&self) -> String {
        if let Some(level) = self.log_level.as_deref().filter(|l| !l.trim().is_empty()) {
            return level.to_string();
        }
        if self.quiet {
            return "error".to_string();
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    }
}
