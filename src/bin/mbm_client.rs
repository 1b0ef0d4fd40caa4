//! mbm_client — asks a server whether the path to it sustains a target rate.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use mbm_engine::{run_once, run_sweep, ClientOptions, SocketType, TestConfig, Verdict};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum SocketTypeArg {
    Tcp,
    Udp,
}

impl From<SocketTypeArg> for SocketType {
    fn from(arg: SocketTypeArg) -> SocketType {
        match arg {
            SocketTypeArg::Tcp => SocketType::Tcp,
            SocketTypeArg::Udp => SocketType::Udp,
        }
    }
}

#[derive(Parser)]
#[clap(
    name = "mbm_client",
    version,
    about = "Model-based path measurement client\n\nReceives paced CBR traffic from an mbm_server and reports whether the path met its loss budget."
)]
struct Cli {
    /// Server hostname or address
    #[clap(long)]
    server: String,

    /// Server control port
    #[clap(long)]
    port: u16,

    /// Data channel transport
    #[clap(long = "socket_type", value_enum, default_value = "tcp")]
    socket_type: SocketTypeArg,

    /// Target rate in kb/s
    #[clap(long, default_value = "600")]
    rate: u32,

    /// Target round-trip time in ms
    #[clap(long, default_value = "10")]
    rtt: u32,

    /// Target MSS in bytes
    #[clap(long, default_value = "1460")]
    mss: u32,

    /// Advisory packets-per-burst hint
    #[clap(long = "burst_size", default_value = "0")]
    burst_size: u32,

    /// Sweep rates over UDP, then confirm the best rate over TCP
    #[clap(long)]
    sweep: bool,

    /// Sweep start rate in kb/s
    #[clap(long)]
    minrate: Option<u32>,

    /// Sweep end rate in kb/s
    #[clap(long)]
    maxrate: Option<u32>,

    /// Sweep step in kb/s
    #[clap(long)]
    ratestep: Option<u32>,

    /// Dump received packets to <timestamp>_clientdata.txt in this directory
    #[clap(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Write a JSON report to this file (default: human-readable summary)
    #[clap(long)]
    output: Option<PathBuf>,

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
        EnvFilter::from_default_env().add_directive("warn".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.port == 0 {
        eprintln!("--port must be a nonzero port number");
        std::process::exit(1);
    }

    let options = ClientOptions {
        server: cli.server.clone(),
        port: cli.port,
        log_dir: cli.log_dir.clone(),
    };
    let config = TestConfig::new(
        cli.socket_type.into(),
        cli.rate,
        cli.rtt,
        cli.mss,
        cli.burst_size,
    );

    let verdict = if cli.sweep {
        let (Some(minrate), Some(maxrate), Some(ratestep)) =
            (cli.minrate, cli.maxrate, cli.ratestep)
        else {
            eprintln!("--sweep requires --minrate, --maxrate, and --ratestep");
            std::process::exit(1)
        };
        let report = run_sweep(&options, &config, minrate, maxrate, ratestep)?;

        emit(&cli.output, &report)?;
        for run in &report.runs {
            println!(
                "  {:>8} kb/s  {:<12}  received {} packets ({:.0} kb/s observed)",
                run.cbr_kb_s, run.verdict.to_string(), run.packets_received, run.observed_rate_kb_s
            );
        }
        println!(
            "selected {} kb/s — TCP confirmation: {}",
            report.selected_rate_kb_s, report.confirmation.verdict
        );
        report.confirmation.verdict
    } else {
        let report = run_once(&options, &config)?;

        emit(&cli.output, &report)?;
        println!(
            "{}: {} kb/s over {:?}, received {} packets / {} bytes ({:.0} kb/s observed)",
            report.verdict,
            report.cbr_kb_s,
            report.socket_type,
            report.packets_received,
            report.bytes_received,
            report.observed_rate_kb_s
        );
        report.verdict
    };

    if verdict == Verdict::Error {
        std::process::exit(1);
    }
    Ok(())
}

fn emit<T: serde::Serialize>(output: &Option<PathBuf>, report: &T) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(report)?)?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}
