//! CLI for the sealed-envelope engine: fetch, simulate, verify, audit, serve.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sealed")]
#[command(about = "sealed: commit-reveal forced-choice trials, verified offline")]
#[command(version = sealed_core::VERSION)]
struct Cli {
    /// Engine configuration file (JSON). Flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch raw bytes from one entropy source (no fallback)
    Fetch {
        /// Source kind: hardware-proxy, quantum-proxy, local-secure-random
        #[arg(long, default_value = "local-secure-random")]
        source: String,

        /// Proxy endpoint URL (required for hardware-proxy and quantum-proxy)
        #[arg(long)]
        endpoint: Option<String>,

        /// Number of bytes
        #[arg(long, default_value = "32")]
        bytes: usize,

        /// Output format
        #[arg(long, default_value = "hex", value_parser = ["hex", "json"])]
        format: String,
    },

    /// Run synthetic participants through full commit-reveal sessions and export a bundle
    Simulate {
        /// Trials per block
        #[arg(long, default_value = "30")]
        trials: usize,

        /// Blocks per session
        #[arg(long, default_value = "1")]
        blocks: usize,

        /// Number of simulated participants (one session each)
        #[arg(long, default_value = "1")]
        participants: usize,

        /// Probability that a simulated participant picks the target
        #[arg(long, default_value = "0.2")]
        hit_rate: f64,

        /// Seed for the simulated participants' choices (entropy stays OS-sourced)
        #[arg(long)]
        seed: Option<u64>,

        /// Index remap strategy: none, hmac-rotation (overrides config)
        #[arg(long, value_parser = ["none", "hmac-rotation"])]
        remap: Option<String>,

        /// Write the export bundle here
        #[arg(long)]
        out: PathBuf,

        /// Persist documents in this directory instead of memory
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Verify an exported bundle offline: digests, tape positions, indices, remap proofs
    Verify {
        /// Export bundle (JSON)
        bundle: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Statistical audit of session documents
    Stats {
        /// Export bundle or array of session documents (JSON)
        sessions: PathBuf,

        /// Aggregation policy
        #[arg(long, default_value = "pooled", value_parser = ["pooled", "first-session"])]
        mode: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a local entropy proxy speaking the byte payload contract
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port
        #[arg(long, default_value = "8042")]
        port: u16,

        /// Per-request byte cap
        #[arg(long, default_value = "65536")]
        max_length: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Fetch {
            source,
            endpoint,
            bytes,
            format,
        } => commands::fetch::run(&config, &source, endpoint.as_deref(), bytes, &format),
        Commands::Simulate {
            trials,
            blocks,
            participants,
            hit_rate,
            seed,
            remap,
            out,
            store,
        } => commands::simulate::run(
            config,
            commands::simulate::SimulateOptions {
                trials,
                blocks,
                participants,
                hit_rate,
                seed,
                remap: remap.as_deref().map(commands::parse_remap),
                store_dir: store,
            },
            &out,
        ),
        Commands::Verify { bundle, json } => commands::verify::run(&bundle, json),
        Commands::Stats { sessions, mode, json } => commands::stats::run(&config, &sessions, &mode, json),
        Commands::Serve { host, port, max_length } => commands::serve::run(&host, port, max_length),
    }
}
