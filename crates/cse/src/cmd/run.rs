use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use utils::version;
use vcd_client::VcdClient;

use super::IntoAnyhow;
use crate::config::cli::RunArgs;
use crate::config::CseConfig;
use crate::config::VcenterRegistry;
use crate::context::ContextFactory;
use crate::install::Installer;
use crate::server::BusListener;
use crate::server::RequestListener;
use crate::server::ServerState;
use crate::server_config::ServerConfig;
use crate::server_config::TEMPLATES_PATH;
use crate::tasks::TaskRunner;
use crate::telemetry::CseOperation;
use crate::telemetry::TelemetryClient;
use crate::template::Catalog;
use crate::util::keyed_lock::KeyedAsyncLock;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime config served to request handlers, with the catalog's
/// templates under `broker.templates`.
async fn server_config(client: &VcdClient, config: &CseConfig) -> Result<ServerConfig> {
    let server_config =
        ServerConfig::from_serializable(&config.redacted()).context("serialize config")?;
    let broker = &config.broker;
    let templates = Catalog::open(client.clone(), &broker.org, &broker.catalog)
        .await
        .into_anyhow()?
        .templates()
        .await
        .into_anyhow()?;
    if templates.is_empty() {
        warn!(catalog = %broker.catalog, "No templates found in catalog");
    }
    info!(count = templates.len(), "Loaded templates");
    server_config.set_value_at(
        TEMPLATES_PATH,
        serde_json::to_value(&templates).context("serialize templates")?,
    );
    Ok(server_config)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        return;
    }
    info!("Received shutdown signal");
    shutdown.cancel();
}

pub async fn run_server(args: RunArgs) -> Result<()> {
    info!("Starting CSE {}", &**version::VERSION);
    let (loaded, options) = super::load(&args.config)?;
    let config = loaded.config;
    if let Some(path) = &args.pks_config_file {
        let pks = super::load_pks(path, &options, &config)?;
        info!(servers = pks.pks_api_servers.len(), "PKS config is valid");
    }
    let vcenters = VcenterRegistry::new(&config.vcs);
    if vcenters.is_empty() {
        warn!("No vCenters configured");
    }
    info!(vcenters = ?vcenters.names(), "Registered vCenters");
    let telemetry = TelemetryClient::new(&config.service.telemetry);

    let client = super::sysadmin_login(&config).await?;
    let startup = async {
        if args.skip_check {
            warn!("Skipping installation check");
        } else {
            let report = Installer::new(client.clone(), config.clone(), telemetry.clone())
                .check()
                .await
                .into_anyhow()?;
            info!(extension = ?report.extension, templates = report.templates.len(), "Installation check passed");
        }
        server_config(&client, &config).await
    }
    .await;
    super::logout(&client).await;
    let server_config = startup?;

    let state = Arc::new(ServerState {
        contexts: ContextFactory::new(
            super::client_config(&config.vcd, config.service.log_wire),
            super::sysadmin_credentials(&config.vcd),
        ),
        server_config: Arc::new(server_config),
        runner: Arc::new(TaskRunner::new(config.service.processors)),
        locks: Arc::new(KeyedAsyncLock::new()),
        telemetry: telemetry.clone(),
        legacy_mode: config.legacy_mode(),
        enforce_authorization: config.service.enforce_authorization,
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let bus = match &config.mqtt {
        Some(mqtt) if !config.legacy_mode() => {
            Some(BusListener::new(state.clone(), &config.vcd, mqtt).into_anyhow()?)
        }
        _ => {
            warn!("No MQTT consumer in legacy mode, requests are only taken on the HTTP listener");
            None
        }
    };
    let listener = RequestListener::new(state.clone(), config.service.listen_addr.clone());
    let http = async {
        let result = listener.run(shutdown.clone()).await.into_anyhow();
        // the bus consumer must not outlive a failed listener
        shutdown.cancel();
        result
    };
    let result = match bus {
        Some(bus) => {
            let (http, bus) = tokio::join!(http, bus.run(shutdown.clone()));
            http.and(bus.into_anyhow())
        }
        None => http.await,
    };
    super::record(&telemetry, CseOperation::ServiceRun, &result).await;

    info!(active = state.runner.active(), "Waiting for background jobs");
    state.runner.shutdown(SHUTDOWN_TIMEOUT).await;
    info!("CSE stopped");
    result
}
