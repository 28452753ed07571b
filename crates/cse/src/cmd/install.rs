use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use tracing::info;

use super::IntoAnyhow;
use crate::config::cli::InstallArgs;
use crate::config::cli::UpgradeArgs;
use crate::config::encryption;
use crate::config::read_config_text;
use crate::config::write_private;
use crate::config::LoadOptions;
use crate::install::extension::MqttToken;
use crate::install::InstallOptions;
use crate::install::InstallOutcome;
use crate::install::Installer;
use crate::pks;
use crate::telemetry::TelemetryClient;

fn read_ssh_key(path: Option<&PathBuf>) -> Result<Option<String>> {
    path.map(|p| std::fs::read_to_string(p).with_context(|| format!("read ssh key {}", p.display())))
        .transpose()
}

/// Writes the MQTT token of a fresh install into the `mqtt` section of
/// the config file, keeping its encryption.
pub fn persist_mqtt_token(path: &Path, options: &LoadOptions, token: &MqttToken) -> Result<()> {
    let (text, _) = read_config_text(path, options).into_anyhow()?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&text).context("parse config")?;
    let root = doc
        .as_mapping_mut()
        .context("config root is not a mapping")?;
    let mqtt = root
        .entry("mqtt".into())
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    let mqtt = mqtt
        .as_mapping_mut()
        .context("mqtt section is not a mapping")?;
    mqtt.insert("token".into(), token.token.clone().into());
    mqtt.insert("token_id".into(), token.id.clone().into());

    let text = serde_yaml::to_string(&doc).context("serialize config")?;
    let content = match options.password.as_deref().filter(|_| !options.skip_decryption) {
        Some(password) => encryption::encrypt(&text, password)?,
        None => text,
    };
    write_private(path, &content).into_anyhow()?;
    info!(path = %path.display(), "Saved MQTT token to config");
    Ok(())
}

fn summarize(outcome: &InstallOutcome) {
    if outcome.templates_built.is_empty() {
        info!("No templates were built");
    }
    for template in &outcome.templates_built {
        info!(%template, "Template ready");
    }
}

pub async fn run_install(args: InstallArgs) -> Result<()> {
    let (loaded, options) = super::load(&args.config)?;
    let config = loaded.config;
    let pks_config = args
        .pks_config_file
        .as_deref()
        .map(|path| super::load_pks(path, &options, &config))
        .transpose()?;
    let telemetry = TelemetryClient::new(&config.service.telemetry);
    let client = super::sysadmin_login(&config).await?;

    let install_options = InstallOptions {
        skip_template_creation: args.skip_template_creation,
        retain_temp_vapp: args.retain_temp_vapp,
        ssh_key: read_ssh_key(args.ssh_key.as_ref())?,
    };
    let result = async {
        let outcome = Installer::new(client.clone(), config, telemetry)
            .install(&install_options)
            .await
            .into_anyhow()?;
        if let Some(token) = &outcome.mqtt_token {
            persist_mqtt_token(&args.config.config, &options, token)?;
        }
        if let Some(pks_config) = &pks_config {
            let summary = pks::configure(&client, pks_config).await.into_anyhow()?;
            info!(ovdcs = summary.ovdcs.len(), "Configured PKS");
        }
        summarize(&outcome);
        anyhow::Ok(())
    }
    .await;
    super::logout(&client).await;
    result?;
    info!("Installation complete");
    Ok(())
}

pub async fn run_upgrade(args: UpgradeArgs) -> Result<()> {
    let (loaded, _) = super::load(&args.config)?;
    let config = loaded.config;
    let telemetry = TelemetryClient::new(&config.service.telemetry);
    let client = super::sysadmin_login(&config).await?;

    let install_options = InstallOptions {
        skip_template_creation: args.skip_template_creation,
        retain_temp_vapp: args.retain_temp_vapp,
        ssh_key: read_ssh_key(args.ssh_key.as_ref())?,
    };
    let result = Installer::new(client.clone(), config, telemetry)
        .upgrade(&install_options)
        .await
        .into_anyhow();
    super::logout(&client).await;
    summarize(&result?);
    info!("Upgrade complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::load_config;
    use crate::config::sample::sample_config;

    fn token() -> MqttToken {
        MqttToken {
            id: "urn:vcloud:token:1".into(),
            token: "secret-token".into(),
        }
    }

    #[test]
    fn token_is_written_to_plain_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        write_private(&path, &sample_config(false)).expect("write");

        persist_mqtt_token(&path, &LoadOptions::plain(), &token()).expect("persist");
        let loaded = load_config(&path, &LoadOptions::plain()).expect("load");
        let mqtt = loaded.config.mqtt.expect("mqtt section");
        assert_eq!(mqtt.token.as_deref(), Some("secret-token"));
        assert_eq!(mqtt.token_id.as_deref(), Some("urn:vcloud:token:1"));
    }

    #[test]
    fn token_keeps_config_encrypted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.enc");
        let encrypted = encryption::encrypt(&sample_config(false), "pw").expect("encrypt");
        write_private(&path, &encrypted).expect("write");

        let options = LoadOptions::encrypted("pw");
        persist_mqtt_token(&path, &options, &token()).expect("persist");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("secret-token"));
        let loaded = load_config(&path, &options).expect("load");
        assert_eq!(
            loaded.config.mqtt.and_then(|m| m.token),
            Some("secret-token".to_string())
        );
    }
}
