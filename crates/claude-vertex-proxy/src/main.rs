//! `claude-vertex-proxy` binary entrypoint.
//!
//! Configuration comes from `.env`, an optional YAML file and the environment.

use claude_vertex_proxy::{logging, serve, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ProxyConfig::load()?;
    logging::init_subscriber(&config.logging);

    serve(config).await
}
