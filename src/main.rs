use anyhow::Result;
use clap::{Parser, Subcommand};
use cloak::{Config, config, start_server, tool};
use log::info;

// CLI command structure
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional path to config file (defaults to ./cloak.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interception gateway
    Serve {
        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the scrubbing tool server over stdin/stdout
    Tool,
    /// Generate a default config file
    Init {
        /// Path where to save the config file
        #[arg(default_value = "./cloak.toml")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    // Load environment variables
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load config
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }

            info!("Starting server on port {}", config.server.port);
            start_server(config).await?;
        }
        Commands::Tool => {
            tool::server::run(&config).await?;
        }
        Commands::Init { path } => {
            info!("Generating default config file at {}", path);
            config::generate_default_config(&path)?;
            println!("Config file generated successfully at {}", path);
        }
    }

    Ok(())
}
