use anyhow::Result;
use tracing::info;

use super::IntoAnyhow;
use crate::config::cli::CheckArgs;
use crate::install::InstallationReport;
use crate::install::Installer;
use crate::telemetry::CseOperation;
use crate::telemetry::TelemetryClient;

fn print_report(report: &InstallationReport) {
    println!("Extension: {:?}", report.extension);
    println!("CSE version: {}", report.description.cse_version);
    println!("Legacy mode: {}", report.description.legacy_mode);
    if let Some(version) = &report.description.rde_version_in_use {
        println!("RDE version: {version}");
    }
    if !report.placement_policies.is_empty() {
        println!("Placement policies: {}", report.placement_policies.join(", "));
    }
    println!("Templates: {}", report.templates.len());
    for template in &report.templates {
        println!("  {template}");
    }
}

/// Validates the config file; with `--check-install`, also the
/// installation it points at.
pub async fn run_check(args: CheckArgs) -> Result<()> {
    let (loaded, options) = super::load(&args.config)?;
    let config = loaded.config;
    if let Some(path) = &args.pks_config_file {
        super::load_pks(path, &options, &config)?;
        println!("PKS config file is valid");
    }
    let telemetry = TelemetryClient::new(&config.service.telemetry);

    // the login is part of validating the vcd section
    let client = super::sysadmin_login(&config).await?;
    let result = if args.check_install {
        Installer::new(client.clone(), config, telemetry.clone())
            .check()
            .await
            .into_anyhow()
            .map(Some)
    } else {
        Ok(None)
    };
    super::logout(&client).await;
    super::record(&telemetry, CseOperation::ConfigCheck, &result).await;

    println!("Config file is valid");
    if let Some(report) = result? {
        print_report(&report);
        info!("Installation is valid");
    }
    Ok(())
}
