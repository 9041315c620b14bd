// synckairos: process entry point

use tracing::{error, info};

use synckairos::config::Config;
use synckairos::server::SyncKairosServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env_or_default();
    info!(bind_address = %config.server.bind_address, "starting synckairos");

    let server = SyncKairosServer::build(config).await?;

    match server.start().await {
        Ok(()) => {
            info!("server stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "server error");
            Err(Box::new(e))
        }
    }
}
