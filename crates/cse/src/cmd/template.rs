use anyhow::bail;
use anyhow::Result;
use tracing::info;
use vcd_client::VcdClient;

use super::IntoAnyhow;
use crate::config::cli::TemplateCommands;
use crate::config::cli::TemplateImportArgs;
use crate::config::cli::TemplateInstallArgs;
use crate::config::cli::TemplateListArgs;
use crate::install::current_version;
use crate::telemetry::CseOperation;
use crate::telemetry::TelemetryClient;
use crate::template;
use crate::template::BuildOptions;
use crate::template::Catalog;
use crate::template::CookbookClient;
use crate::template::RemoteTemplate;
use crate::template::TemplateRow;

const WILDCARD: &str = "*";

/// Name or revision pattern of `template install`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector<T> {
    All,
    Only(T),
}

impl<T: PartialEq> Selector<T> {
    fn matches(&self, value: &T) -> bool {
        match self {
            Self::All => true,
            Self::Only(expected) => expected == value,
        }
    }
}

pub fn parse_selectors(name: &str, revision: &str) -> Result<(Selector<String>, Selector<u32>)> {
    let name = match name.trim() {
        WILDCARD => Selector::All,
        name => Selector::Only(name.to_string()),
    };
    let revision = match revision.trim() {
        WILDCARD => Selector::All,
        revision => match revision.parse() {
            Ok(r) => Selector::Only(r),
            Err(_) => bail!("template revision must be a number or '{WILDCARD}', got '{revision}'"),
        },
    };
    Ok((name, revision))
}

pub fn select<'a>(
    templates: &'a [RemoteTemplate],
    name: &Selector<String>,
    revision: &Selector<u32>,
) -> Vec<&'a RemoteTemplate> {
    templates
        .iter()
        .filter(|t| name.matches(&t.metadata.name) && revision.matches(&t.metadata.revision))
        .collect()
}

pub fn format_rows(rows: &[TemplateRow]) -> String {
    let name_width = rows
        .iter()
        .map(|r| r.name.len())
        .chain(std::iter::once("NAME".len()))
        .max()
        .unwrap_or_default();
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    let mut out = format!(
        "{:<name_width$}  {:>8}  {:<8}  {:<10}  {:<10}  {:<9}  {}\n",
        "NAME", "REVISION", "KIND", "KUBERNETES", "DEPRECATED", "INSTALLED", "COOKBOOK"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<name_width$}  {:>8}  {:<8}  {:<10}  {:<10}  {:<9}  {}\n",
            row.name,
            row.revision,
            row.kind,
            row.kubernetes_version,
            yes_no(row.deprecated),
            yes_no(row.installed),
            yes_no(row.in_cookbook),
        ));
    }
    out
}

async fn list(client: &VcdClient, args: &TemplateListArgs, config: &crate::config::CseConfig) -> Result<()> {
    let broker = &config.broker;
    let installed = Catalog::open(client.clone(), &broker.org, &broker.catalog)
        .await
        .into_anyhow()?
        .templates()
        .await
        .into_anyhow()?;
    let cookbook = CookbookClient::new(&broker.remote_template_cookbook_url).into_anyhow()?;
    let remote = if args.display_all {
        cookbook.fetch_all().await
    } else {
        cookbook.fetch(&current_version().into_anyhow()?, config.legacy_mode()).await
    }
    .into_anyhow()?;
    print!("{}", format_rows(&template::template_rows(&installed, &remote.templates)));
    Ok(())
}

async fn install(client: &VcdClient, args: &TemplateInstallArgs, config: &crate::config::CseConfig) -> Result<()> {
    let (name, revision) = parse_selectors(&args.template_name, &args.template_revision)?;
    let ssh_key = args
        .ssh_key
        .as_ref()
        .map(std::fs::read_to_string)
        .transpose()?;
    let options = BuildOptions {
        force: args.force,
        retain_temp_vapp: args.retain_temp_vapp,
        ssh_key,
        ..Default::default()
    };
    let (builder, cookbook) = template::open_builder(client, config, options).await.into_anyhow()?;
    let remote = cookbook
        .fetch(&current_version().into_anyhow()?, config.legacy_mode())
        .await
        .into_anyhow()?;
    let selected = select(&remote.templates, &name, &revision);
    if selected.is_empty() {
        bail!(
            "no supported template matches '{}' revision '{}'",
            args.template_name,
            args.template_revision
        );
    }
    for template in selected {
        let item = template.metadata.catalog_item_name();
        if builder.install(&cookbook, template).await.into_anyhow()? {
            println!("Installed template {item}");
        } else {
            println!("Template {item} already exists, use --force to re-create it");
        }
    }
    Ok(())
}

async fn import(client: &VcdClient, args: &TemplateImportArgs, config: &crate::config::CseConfig) -> Result<()> {
    if config.legacy_mode() {
        bail!("TKGm templates cannot be imported in legacy mode");
    }
    let options = BuildOptions {
        force: args.force,
        ..Default::default()
    };
    let (builder, _) = template::open_builder(client, config, options).await.into_anyhow()?;
    let imported = builder
        .import(&args.file, args.template_name.as_deref(), args.template_revision)
        .await
        .into_anyhow()?;
    println!("Imported template {}", imported.catalog_item_name());
    Ok(())
}

pub async fn run_template(command: TemplateCommands) -> Result<()> {
    let (config_args, operation) = match &command {
        TemplateCommands::List(args) => (&args.config, CseOperation::TemplateList),
        TemplateCommands::Install(args) => (&args.config, CseOperation::TemplateInstall),
        TemplateCommands::Import(args) => (&args.config, CseOperation::TemplateImport),
    };
    let (loaded, _) = super::load(config_args)?;
    let config = loaded.config;
    let telemetry = TelemetryClient::new(&config.service.telemetry);
    let client = super::sysadmin_login(&config).await?;

    let result = match &command {
        TemplateCommands::List(args) => list(&client, args, &config).await,
        TemplateCommands::Install(args) => install(&client, args, &config).await,
        TemplateCommands::Import(args) => import(&client, args, &config).await,
    };
    super::logout(&client).await;
    super::record(&telemetry, operation, &result).await;
    info!(%operation, ok = result.is_ok(), "Template command finished");
    result
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::template::TemplateMetadata;

    fn remote(name: &str, revision: u32) -> RemoteTemplate {
        RemoteTemplate {
            metadata: TemplateMetadata {
                name: name.into(),
                revision,
                ..Default::default()
            },
            source_ova: format!("https://x/{name}.ova"),
            source_ova_name: format!("{name}.ova"),
            sha256_ova: String::new(),
            cpu: 2,
            mem: 2048,
        }
    }

    #[test]
    fn wildcards_select_templates() {
        let templates = vec![remote("photon", 1), remote("photon", 2), remote("ubuntu", 1)];
        let picked = |name: &str, revision: &str| {
            let (n, r) = parse_selectors(name, revision).expect("selectors");
            select(&templates, &n, &r)
                .iter()
                .map(|t| t.metadata.catalog_item_name())
                .collect::<Vec<_>>()
        };
        assert_eq!(picked("*", "*").len(), 3);
        assert_eq!(picked("photon", "*").len(), 2);
        assert_eq!(picked("*", "1").len(), 2);
        assert_eq!(picked("ubuntu", "1"), vec!["ubuntu_rev1".to_string()]);
        assert!(picked("ubuntu", "3").is_empty());
    }

    #[test]
    fn revision_must_be_numeric() {
        assert!(parse_selectors("photon", "latest").is_err());
    }

    #[test]
    fn rows_are_aligned() {
        let rows = vec![TemplateRow {
            name: "ubuntu-16.04_k8-1.21_weave-2.8.1".into(),
            revision: 2,
            kind: "native".into(),
            kubernetes_version: "1.21".into(),
            deprecated: false,
            installed: true,
            in_cookbook: true,
        }];
        let table = format_rows(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("NAME "));
        assert!(lines[1].starts_with("ubuntu-16.04_k8-1.21_weave-2.8.1  "));
        assert!(lines[1].ends_with("yes"));
    }
}
