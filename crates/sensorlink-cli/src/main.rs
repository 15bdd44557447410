//! CLI for sensorlink: poll a sensor server at a fixed rate, or be one.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sensorlink")]
#[command(about = "sensorlink: fixed-rate telemetry polling with sliding-window averages")]
#[command(version = sensorlink_core::VERSION)]
struct Cli {
    /// Log verbosity: off, error, warn, info, debug, trace (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info", value_parser = commands::parse_log_level)]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a sensor server and report window averages until Ctrl+C
    Client {
        /// Server host name or address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Request rate in Hz
        #[arg(long, default_value = "600")]
        rate: f64,

        /// Samples per sliding window
        #[arg(long, default_value = "50")]
        window: usize,

        /// Report after every push once a window is full, not just when it first fills
        #[arg(long)]
        every_full_window: bool,

        /// Print reports and the final summary as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Run the simulated sensor server until Ctrl+C
    Server {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Listen backlog
        #[arg(long, default_value = "10")]
        backlog: u32,

        /// Connections served concurrently
        #[arg(long, default_value = "64")]
        max_connections: usize,

        /// Seed for reproducible readings (default: OS entropy)
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    commands::init_logging(cli.log_level);

    let code = match cli.command {
        Commands::Client {
            host,
            port,
            rate,
            window,
            every_full_window,
            json,
        } => commands::client::run(commands::client::ClientCommandConfig {
            host,
            port,
            rate,
            window,
            every_full_window,
            json,
        }),
        Commands::Server {
            host,
            port,
            backlog,
            max_connections,
            seed,
        } => commands::server::run(sensorlink_server::ServerConfig {
            host,
            port,
            backlog,
            max_connections,
            seed,
        }),
    };
    std::process::exit(code);
}
