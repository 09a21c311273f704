//! Configuration module.
//!
//! Defines the command-line interface for the linker using `clap`: input
//! object files, the output executable path, and the switches forwarded
//! into the [`crate::linker::LinkRequest`].

use clap::Parser;
use std::path::PathBuf;

/// A symbol-resolving linker for x86_64 ELF executables.
///
/// Combines independently-compiled object files into a single executable,
/// resolving symbols across compilation units.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files, in link order
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short, long, default_value = "a.out", help = "Path to the output executable")]
    pub output: PathBuf,

    /// Entry point symbol
    #[arg(long, default_value = "main", help = "Symbol used as the program entry point")]
    pub entry: String,

    /// Record debug info in the executable metadata
    #[arg(long)]
    pub debug_info: bool,

    /// Permit unresolved symbols in the output
    #[arg(long)]
    pub allow_undefined: bool,

    /// Link object files in parallel (currently falls back to sequential)
    #[arg(long)]
    pub parallel: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}
