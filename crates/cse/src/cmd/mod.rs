//! Command layer - Entry points for the `cse` subcommands

pub mod check;
pub mod config_file;
pub mod install;
pub mod pks;
pub mod prompt;
pub mod run;
pub mod service_role;
pub mod template;

pub use check::run_check;
pub use config_file::{run_decrypt, run_encrypt, run_sample};
pub use install::{run_install, run_upgrade};
pub use pks::run_pks_configure;
pub use run::run_server;
pub use service_role::run_create_service_role;
pub use template::run_template;

use std::fmt::Debug;
use std::path::Path;

use anyhow::Result;
use tracing::info;
use vcd_client::ClientConfig;
use vcd_client::Credentials;
use vcd_client::VcdClient;

use crate::config::cli::ConfigArgs;
use crate::config::load_config;
use crate::config::load_pks_config;
use crate::config::schema::VcdConfig;
use crate::config::CseConfig;
use crate::config::LoadOptions;
use crate::config::Loaded;
use crate::config::PksConfig;
use crate::telemetry::CseOperation;
use crate::telemetry::OperationStatus;
use crate::telemetry::TelemetryClient;

/// Converts an error-stack report into an `anyhow` error, keeping the
/// whole chain in the message.
pub(crate) trait IntoAnyhow<T> {
    fn into_anyhow(self) -> Result<T>;
}

impl<T, C> IntoAnyhow<T> for Result<T, error_stack::Report<C>>
where
    C: Debug + Send + Sync + 'static,
{
    fn into_anyhow(self) -> Result<T> {
        self.map_err(|report| anyhow::anyhow!("{report:?}"))
    }
}

/// Load options for `args`, asking for the password when the file is
/// encrypted.
pub fn load_options(args: &ConfigArgs) -> Result<LoadOptions> {
    if args.skip_config_decryption {
        return Ok(LoadOptions::plain());
    }
    Ok(LoadOptions::encrypted(prompt::config_password()?))
}

pub fn load(args: &ConfigArgs) -> Result<(Loaded<CseConfig>, LoadOptions)> {
    let options = load_options(args)?;
    let loaded = load_config(&args.config, &options).into_anyhow()?;
    Ok((loaded, options))
}

/// PKS config, decrypted with the same options as the main config.
pub fn load_pks(path: &Path, options: &LoadOptions, config: &CseConfig) -> Result<PksConfig> {
    Ok(load_pks_config(path, options, config).into_anyhow()?.config)
}

pub fn client_config(vcd: &VcdConfig, log_wire: bool) -> ClientConfig {
    ClientConfig::new(vcd.base_url())
        .with_api_version(vcd.api_version.clone())
        .with_verify_ssl(vcd.verify)
        .with_log_wire(log_wire || vcd.log)
}

pub fn sysadmin_credentials(vcd: &VcdConfig) -> Credentials {
    Credentials::system(vcd.username.clone(), vcd.password.clone())
}

/// Logs in as the sysadmin of `config`.
pub async fn sysadmin_login(config: &CseConfig) -> Result<VcdClient> {
    let client = VcdClient::login(
        client_config(&config.vcd, config.service.log_wire),
        &sysadmin_credentials(&config.vcd),
    )
    .await
    .into_anyhow()?;
    info!(host = %config.vcd.host, user = %config.vcd.username, "Logged in to vCD");
    Ok(client)
}

/// Best-effort logout; a failure is only logged.
pub async fn logout(client: &VcdClient) {
    if let Err(e) = client.logout().await {
        tracing::warn!("vCD logout failed: {e:?}");
    }
}

/// Sends the telemetry event of a finished command.
pub async fn record<T>(telemetry: &TelemetryClient, operation: CseOperation, result: &Result<T>) {
    let status = if result.is_ok() {
        OperationStatus::Success
    } else {
        OperationStatus::Failed
    };
    telemetry.record(operation, status).await;
}
