use clap::Parser;
use leverage_worker::cli::{Cli, Commands};
use leverage_worker::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config from {}: {}", cli.config, e);
            eprintln!("Using default configuration");
            let mut config: Config = toml::from_str(include_str!("../config.toml.example"))?;
            config.broker.resolve_credentials();
            config
        }
    };

    // Initialize telemetry
    let _telemetry = leverage_worker::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Run(args) => {
            tracing::info!(mode = config.broker.mode.as_str(), simulate = args.simulate, "Starting engine");
            args.execute(config).await?;
        }
        Commands::Status(args) => args.execute(&config)?,
        Commands::Halt(args) => args.execute(&config)?,
        Commands::Resume(args) => args.execute(&config)?,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
