//! Entry point for the rld linker.
//!
//! High-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize `tracing` with the requested log level.
//! 3. Configure a `Linker` from the arguments.
//! 4. Execute the pipeline and report the structured result.
//!
//! Error handling is done via `anyhow`; any pipeline failure exits
//! non-zero with the undefined symbols enumerated individually.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rld::config::Config;
use rld::linker::{LinkRequest, Linker};

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut linker = Linker::new();
    linker.configure(LinkRequest {
        object_files: config.inputs.clone(),
        output_path: config.output.clone(),
        generate_debug_info: config.debug_info,
        allow_undefined_symbols: config.allow_undefined,
        weak_symbol_resolution: false,
        entry_point_symbol: config.entry.clone(),
        parallel_linking: config.parallel,
    });

    let result = linker.execute();

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }

    if result.success {
        println!(
            "Linked {} object files to {} ({} symbols resolved)",
            config.inputs.len(),
            config.output.display(),
            result.symbols_resolved
        );
        Ok(())
    } else {
        for name in &result.undefined_symbol_names {
            eprintln!("undefined symbol: {name}");
        }
        anyhow::bail!(
            "{}",
            result.error.as_deref().unwrap_or("linking failed")
        );
    }
}
