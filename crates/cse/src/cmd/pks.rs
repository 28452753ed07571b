use anyhow::Result;

use super::IntoAnyhow;
use crate::config::cli::PksConfigureArgs;
use crate::pks;
use crate::telemetry::CseOperation;
use crate::telemetry::TelemetryClient;

pub async fn run_pks_configure(args: PksConfigureArgs) -> Result<()> {
    let (loaded, options) = super::load(&args.config)?;
    let config = loaded.config;
    let pks_config = super::load_pks(&args.pks_config_file, &options, &config)?;
    let telemetry = TelemetryClient::new(&config.service.telemetry);
    let client = super::sysadmin_login(&config).await?;

    let result = pks::configure(&client, &pks_config).await.into_anyhow();
    super::logout(&client).await;
    super::record(&telemetry, CseOperation::PksConfigure, &result).await;

    let summary = result?;
    for ovdc in &summary.ovdcs {
        println!("Configured org VDC {ovdc}");
    }
    for (server, section) in &summary.firewall_sections {
        println!("NSX-T server {server}: firewall section {section}");
    }
    Ok(())
}
