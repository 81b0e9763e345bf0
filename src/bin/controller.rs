use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trustplane::config::ControllerConfig;
use trustplane::{APP_NAME, VERSION};

#[tokio::main]
async fn main() {
    trustplane::observability::init_logging();

    info!(app_name = APP_NAME, version = VERSION, "starting trustplane controller");

    let config = match ControllerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid controller configuration");
            std::process::exit(1);
        }
    };
    info!(
        grpc_address = %config.grpc_bind_address(),
        admin_address = %config.admin_bind_address(),
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

    if let Err(e) = trustplane::controller::start_controller(config, cancel).await {
        error!(error = %e, "controller failed");
        std::process::exit(1);
    }
}
