use anyhow::Result;
use clap::{Parser, Subcommand};
use imp_providers_service::{ConfigArgs, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "imp-providers-service", version, about = "IM providers service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the webhook server and the bus dispatcher
    #[command(alias = "s")]
    Server(ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = ServiceConfig::load(&args)?;
            imp_providers_service::run(config).await
        }
    }
}
