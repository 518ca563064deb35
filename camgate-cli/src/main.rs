mod devices;
mod handlers;
mod server;

use clap::{Parser, Subcommand};
use std::time::Duration;

use camgate_core::config::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_MAX_TOTAL_COST};
use camgate_core::EngineConfig;

#[derive(Parser)]
#[command(
    name = "camgate",
    about = "camgate - priority arbitration for shared camera devices",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camgate HTTP server over simulated hardware
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3200")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Simulated devices: "id:cost[:flash][:conflicts=a|b],..."
        #[arg(long, default_value = devices::DEFAULT_DEVICES, env = "CAMGATE_DEVICES")]
        devices: String,

        /// Aggregate resource cost all open sessions may consume
        #[arg(long, default_value_t = DEFAULT_MAX_TOTAL_COST, env = "CAMGATE_MAX_COST")]
        max_cost: u32,

        /// How long a connect waits for other connects to finish
        #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS, env = "CAMGATE_CONNECT_TIMEOUT_MS")]
        connect_timeout_ms: u64,

        /// How long a connect waits for each evicted client to disconnect
        #[arg(long, default_value_t = DEFAULT_DISCONNECT_TIMEOUT_MS, env = "CAMGATE_DISCONNECT_TIMEOUT_MS")]
        disconnect_timeout_ms: u64,
    },

    /// Parse a device list and print it as JSON
    Devices {
        #[arg(default_value = devices::DEFAULT_DEVICES)]
        list: String,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            devices,
            max_cost,
            connect_timeout_ms,
            disconnect_timeout_ms,
        } => {
            let devices = match devices::parse_devices(&devices) {
                Ok(devices) => devices,
                Err(e) => {
                    tracing::error!(error = %e, "Invalid device list");
                    std::process::exit(2);
                }
            };
            let config = EngineConfig::default()
                .with_max_total_cost(max_cost)
                .with_connect_timeout(Duration::from_millis(connect_timeout_ms))
                .with_disconnect_timeout(Duration::from_millis(disconnect_timeout_ms));
            server::run(&host, port, config, devices).await;
        }
        Commands::Devices { list } => match devices::parse_devices(&list) {
            Ok(devices) => match serde_json::to_string_pretty(&devices) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Could not encode devices: {e}");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        },
        Commands::Version => {
            println!("camgate {}", env!("CARGO_PKG_VERSION"));
            println!("Admission control for shared camera devices");
        }
    }
}
