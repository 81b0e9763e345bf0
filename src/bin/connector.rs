use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trustplane::config::ConnectorConfig;
use trustplane::{APP_NAME, VERSION};

#[tokio::main]
async fn main() {
    trustplane::observability::init_logging();

    info!(app_name = APP_NAME, version = VERSION, "starting trustplane connector");

    let config = match ConnectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid connector configuration");
            std::process::exit(1);
        }
    };
    info!(
        id = %config.id,
        controller = %config.controller_addr,
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

    // A lost identity exits non-zero so the supervisor restarts us into a
    // fresh enrollment.
    if let Err(e) = trustplane::connector::run_connector(config, cancel).await {
        error!(error = %e, "connector failed");
        std::process::exit(1);
    }
}
