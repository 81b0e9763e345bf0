use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trustplane::config::TunnelerConfig;
use trustplane::{APP_NAME, VERSION};

#[tokio::main]
async fn main() {
    trustplane::observability::init_logging();

    info!(app_name = APP_NAME, version = VERSION, "starting trustplane tunneler");

    let config = match TunnelerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid tunneler configuration");
            std::process::exit(1);
        }
    };
    info!(
        id = %config.id,
        connector = %config.connector_addr,
        trust_domain = %config.trust_domain,
        "loaded configuration from environment"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    if let Err(e) = trustplane::tunneler::run_tunneler(config, cancel).await {
        error!(error = %e, "tunneler failed");
        std::process::exit(1);
    }
}
