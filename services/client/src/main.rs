use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_client::control::run_session;
use tunnel_client::liveness::{decide_reconnect, ReconnectDecision};
use tunnel_client::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(client_id = %config.client_id, remote = %config.remote_url, "tunnel client starting");

    let http = reqwest::Client::new();

    loop {
        let end = run_session(&config, http.clone()).await;
        match decide_reconnect(end) {
            ReconnectDecision::Immediate => {}
            ReconnectDecision::After(delay) => tokio::time::sleep(delay).await,
            ReconnectDecision::Stop => {
                warn!("control channel unauthorized, giving up");
                break;
            }
        }
    }
}
