use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use smartthings2mqtt::config::LogLevel;
use smartthings2mqtt::mqtt::RumqttcTransport;
use smartthings2mqtt::webhook::{self, WebhookState};
use smartthings2mqtt::{
    EndpointCache, MqttSession, MqttSessionSettings, Settings, SmartAppClient, SyncSettings,
    Synchronizer,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(version, about = "Bridges SmartThings devices and an MQTT broker")]
struct Cli {
    /// Configuration file (defaults to <config dir>/smartthings2mqtt/config.toml)
    #[arg(short, long, env = "SMARTTHINGS2MQTT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let set_log_level = setup()?;

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&path).await?;
    set_log_level(settings.log_level);
    info!("Loaded configuration from {}", path.display());

    let client = SmartAppClient::new(
        &settings.bridge.bridge_to_st_auth_token,
        settings.smartthings.endpoints_url.clone(),
    )?;
    let endpoints = EndpointCache::new(Arc::new(client));

    let mqtt = MqttSession::spawn(
        RumqttcTransport::new(settings.broker.clone()),
        MqttSessionSettings::new(settings.bridge.status_topic.clone()),
    );

    let sync = Arc::new(Synchronizer::new(
        mqtt.clone(),
        endpoints.clone(),
        SyncSettings::new(
            settings.bridge.topic_namespace.clone(),
            settings.smartthings.location_id.clone(),
        ),
    ));
    sync.enable();

    let shutdown = CancellationToken::new();
    let app = webhook::router(WebhookState::new(
        sync.clone(),
        &settings.bridge.st_to_bridge_auth_token,
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(settings.server.listen)
        .await
        .map_err(|e| eyre!("Failed to listen on {}: {}", settings.server.listen, e))?;
    info!("Waiting for SmartApp notifications on {}", settings.server.listen);

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
            server_shutdown.cancel();
        })
        .await;

    sync.dispose();
    endpoints.dispose();
    mqtt.shutdown();

    served.map_err(|e| eyre!("Webhook server failed: {}", e))
}

/// Installs error reporting and logging. The returned closure applies the
/// configured level unless `RUST_LOG` is set.
fn setup() -> Result<impl Fn(LogLevel)> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(setup_logging_env())
}

fn setup_logging_env() -> impl Fn(LogLevel) {
    let from_env = std::env::var("RUST_LOG").is_ok();
    let filter = if from_env {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(LogLevel::default().as_str())
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .with_filter_reloading();
    let handle = builder.reload_handle();
    builder.init();

    move |level: LogLevel| {
        if from_env {
            return;
        }
        if let Err(e) = handle.reload(EnvFilter::new(level.as_str())) {
            warn!("Failed to apply log level {}: {}", level.as_str(), e);
        }
    }
}
