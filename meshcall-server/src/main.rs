use clap::Parser;
use meshcall_server::config::ServerConfig;
use meshcall_server::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json_logs = std::env::var("MESHCALL_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("meshcall_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();
    tracing::info!(
        control_addr = %config.control_addr,
        media_addr = %config.media_addr,
        "starting meshcall-server",
    );

    Server::new(config).run().await
}
