//! mbm_server — paces traffic at clients and judges the path.

use anyhow::Result;
use clap::Parser;
use mbm_engine::constants::{BASE_PORT, NUM_PORTS};
use mbm_engine::{Dispatcher, ServerOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "mbm_server",
    version,
    about = "Model-based path measurement server\n\nAccepts control connections, paces CBR traffic at each client over TCP or UDP, and returns a PASS/FAIL/INCONCLUSIVE verdict per session."
)]
struct Cli {
    /// Control port to listen on
    #[clap(long)]
    port: u16,

    /// Write per-session serverdata/testdata dumps into this directory
    #[clap(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log at debug level
    #[clap(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    // Argument errors exit 1; --help/--version still exit 0.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 })
    });

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive("debug".parse()?)
    } else {
        EnvFilter::from_default_env().add_directive("info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.port == 0 {
        eprintln!("--port must be a nonzero port number");
        std::process::exit(1);
    }

    let dispatcher = Dispatcher::bind(&ServerOptions {
        port: cli.port,
        base_port: BASE_PORT,
        num_ports: NUM_PORTS,
        log_dir: cli.log_dir,
    })?;
    dispatcher.run()?;
    Ok(())
}
