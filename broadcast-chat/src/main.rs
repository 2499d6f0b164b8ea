use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use broadcast_chat::{
    cli::{Cli, Command},
    client::{self, Disconnect},
    config::ServerConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = ServerConfig::try_from(args)?;
            let server = Server::bind(&config).await?;
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            // A pending stdin read cannot be cancelled, so leave without
            // waiting for the runtime to wind down.
            if client::run(args).await? == Disconnect::ServerClosed {
                std::process::exit(0);
            }
        }
    }

    Ok(())
}
