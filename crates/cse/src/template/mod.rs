//! Kubernetes templates: catalog metadata, the remote cookbook, and the
//! install/import workflows.

pub mod builder;
pub mod catalog;
pub mod cookbook;
pub mod error;
pub mod metadata;
pub mod ova;

use std::collections::BTreeMap;

use api_types::QueryRecord;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use semver::Version;
use serde::Serialize;
use tracing::info;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;

pub use builder::BuildOptions;
pub use builder::Placement;
pub use builder::TemplateBuilder;
pub use catalog::Catalog;
pub use cookbook::CookbookClient;
pub use cookbook::RemoteTemplate;
pub use error::TemplateError;
pub use error::TemplateResult;
pub use metadata::TemplateMetadata;

use crate::compute_policy::ComputePolicyManager;
use crate::config::CseConfig;

/// Row of `template list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateRow {
    pub name: String,
    pub revision: u32,
    pub kind: String,
    pub kubernetes_version: String,
    pub deprecated: bool,
    pub installed: bool,
    pub in_cookbook: bool,
}

impl TemplateRow {
    fn from_metadata(template: &TemplateMetadata) -> Self {
        Self {
            name: template.name.clone(),
            revision: template.revision,
            kind: template.kind.clone(),
            kubernetes_version: template.kubernetes_version.clone(),
            deprecated: template.deprecated,
            installed: false,
            in_cookbook: false,
        }
    }
}

/// Joins installed and cookbook templates by name and revision.
pub fn template_rows(installed: &[TemplateMetadata], cookbook: &[RemoteTemplate]) -> Vec<TemplateRow> {
    let mut rows: BTreeMap<(String, u32), TemplateRow> = BTreeMap::new();
    for template in installed {
        rows.entry((template.name.clone(), template.revision))
            .or_insert_with(|| TemplateRow::from_metadata(template))
            .installed = true;
    }
    for remote in cookbook {
        let template = &remote.metadata;
        rows.entry((template.name.clone(), template.revision))
            .or_insert_with(|| TemplateRow::from_metadata(template))
            .in_cookbook = true;
    }
    rows.into_values().collect()
}

/// Builder and cookbook client for the `broker` section of `config`.
/// Creates the catalog when it is missing.
pub async fn open_builder(
    client: &VcdClient,
    config: &CseConfig,
    options: BuildOptions,
) -> TemplateResult<(TemplateBuilder, CookbookClient)> {
    let broker = &config.broker;
    let catalog = Catalog::open_or_create(client.clone(), &broker.org, &broker.catalog).await?;
    let vdc = client
        .query_records::<QueryRecord>(
            "adminOrgVdc",
            Some(construct_filter_string(&[
                ("name", broker.vdc.as_str()),
                ("orgName", broker.org.as_str()),
            ])),
        )
        .boxed()
        .try_next()
        .await
        .change_context(TemplateError::vcd(format!("look up VDC {}", broker.vdc)))?
        .ok_or_else(|| Report::new(TemplateError::vcd(format!("VDC '{}' not found", broker.vdc))))?;
    let policies = if config.legacy_mode() {
        None
    } else {
        Some(
            ComputePolicyManager::new(client.clone())
                .await
                .change_context(TemplateError::vcd("open compute policy manager"))?,
        )
    };
    let placement = Placement {
        vdc_href: vdc.href.replace("/api/admin/vdc/", "/api/vdc/"),
        network: broker.network.clone(),
        storage_profile: broker.storage_profile.clone(),
        ip_allocation_mode: broker.ip_allocation_mode.clone(),
    };
    let cookbook = CookbookClient::new(&broker.remote_template_cookbook_url)?;
    Ok((TemplateBuilder::new(catalog, placement, policies, options), cookbook))
}

/// Installs every supported cookbook template, or only `only`
/// (`name`, `revision`). Returns the catalog item names that were built.
pub async fn install_templates(
    builder: &TemplateBuilder,
    cookbook: &CookbookClient,
    cse_version: &Version,
    legacy_mode: bool,
    only: Option<(&str, u32)>,
) -> TemplateResult<Vec<String>> {
    let remote = cookbook.fetch(cse_version, legacy_mode).await?;
    let selected: Vec<&RemoteTemplate> = match only {
        Some((name, revision)) => vec![remote.find(name, revision)?],
        None => remote.templates.iter().collect(),
    };
    let mut built = Vec::new();
    for template in selected {
        if builder.install(cookbook, template).await? {
            built.push(template.metadata.catalog_item_name());
        }
    }
    info!(built = built.len(), "Template installation finished");
    Ok(built)
}
