//! Template metadata stored on catalog items.

use std::collections::BTreeMap;

use api_types::Metadata;
use api_types::MetadataEntry;
use serde::Deserialize;
use serde::Serialize;

use crate::compute_policy::K8sRuntime;

/// Metadata keys written on template catalog items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateKey {
    Name,
    Revision,
    Os,
    Kubernetes,
    KubernetesVersion,
    Cni,
    CniVersion,
    DockerVersion,
    Description,
    MinCseVersion,
    MaxCseVersion,
    Kind,
    ComputePolicy,
    Deprecated,
    UpgradeFrom,
}

impl TemplateKey {
    pub const ALL: [TemplateKey; 15] = [
        TemplateKey::Name,
        TemplateKey::Revision,
        TemplateKey::Os,
        TemplateKey::Kubernetes,
        TemplateKey::KubernetesVersion,
        TemplateKey::Cni,
        TemplateKey::CniVersion,
        TemplateKey::DockerVersion,
        TemplateKey::Description,
        TemplateKey::MinCseVersion,
        TemplateKey::MaxCseVersion,
        TemplateKey::Kind,
        TemplateKey::ComputePolicy,
        TemplateKey::Deprecated,
        TemplateKey::UpgradeFrom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKey::Name => "name",
            TemplateKey::Revision => "revision",
            TemplateKey::Os => "os",
            TemplateKey::Kubernetes => "kubernetes",
            TemplateKey::KubernetesVersion => "kubernetes_version",
            TemplateKey::Cni => "cni",
            TemplateKey::CniVersion => "cni_version",
            TemplateKey::DockerVersion => "docker_version",
            TemplateKey::Description => "description",
            TemplateKey::MinCseVersion => "min_cse_version",
            TemplateKey::MaxCseVersion => "max_cse_version",
            TemplateKey::Kind => "kind",
            TemplateKey::ComputePolicy => "compute_policy",
            TemplateKey::Deprecated => "deprecated",
            TemplateKey::UpgradeFrom => "upgrade_from",
        }
    }
}

/// Template as described by its catalog item metadata, and by the
/// remote cookbook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    pub revision: u32,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub kubernetes: String,
    #[serde(default)]
    pub kubernetes_version: String,
    #[serde(default)]
    pub cni: String,
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub min_cse_version: String,
    #[serde(default)]
    pub max_cse_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub compute_policy: String,
    #[serde(default)]
    pub deprecated: bool,
    /// Comma separated `name:revision` list of templates this one can
    /// upgrade.
    #[serde(default)]
    pub upgrade_from: String,
}

impl TemplateMetadata {
    /// Catalog item name: `<name>_rev<revision>`.
    pub fn catalog_item_name(&self) -> String {
        catalog_item_name(&self.name, self.revision)
    }

    /// Runtime from the `kind` key, falling back to the template name.
    pub fn runtime(&self) -> Option<K8sRuntime> {
        self.kind
            .parse::<K8sRuntime>()
            .ok()
            .or_else(|| K8sRuntime::from_template_name(&self.name))
    }

    fn value(&self, key: TemplateKey) -> String {
        match key {
            TemplateKey::Name => self.name.clone(),
            TemplateKey::Revision => self.revision.to_string(),
            TemplateKey::Os => self.os.clone(),
            TemplateKey::Kubernetes => self.kubernetes.clone(),
            TemplateKey::KubernetesVersion => self.kubernetes_version.clone(),
            TemplateKey::Cni => self.cni.clone(),
            TemplateKey::CniVersion => self.cni_version.clone(),
            TemplateKey::DockerVersion => self.docker_version.clone(),
            TemplateKey::Description => self.description.clone(),
            TemplateKey::MinCseVersion => self.min_cse_version.clone(),
            TemplateKey::MaxCseVersion => self.max_cse_version.clone(),
            TemplateKey::Kind => self.kind.clone(),
            TemplateKey::ComputePolicy => self.compute_policy.clone(),
            TemplateKey::Deprecated => self.deprecated.to_string(),
            TemplateKey::UpgradeFrom => self.upgrade_from.clone(),
        }
    }

    pub fn to_metadata(&self) -> Metadata {
        Metadata {
            metadata_entry: TemplateKey::ALL
                .iter()
                .map(|key| MetadataEntry::string(key.as_str(), self.value(*key)))
                .collect(),
        }
    }

    /// `None` when the item lacks a name or a numeric revision, i.e. was
    /// not created by CSE.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let map: BTreeMap<&str, String> = metadata
            .metadata_entry
            .iter()
            .map(|e| (e.key.as_str(), e.value_string()))
            .collect();
        let get = |key: TemplateKey| map.get(key.as_str()).cloned().unwrap_or_default();
        let name = map.get(TemplateKey::Name.as_str())?.clone();
        let revision = map.get(TemplateKey::Revision.as_str())?.parse().ok()?;
        Some(Self {
            name,
            revision,
            os: get(TemplateKey::Os),
            kubernetes: get(TemplateKey::Kubernetes),
            kubernetes_version: get(TemplateKey::KubernetesVersion),
            cni: get(TemplateKey::Cni),
            cni_version: get(TemplateKey::CniVersion),
            docker_version: get(TemplateKey::DockerVersion),
            description: get(TemplateKey::Description),
            min_cse_version: get(TemplateKey::MinCseVersion),
            max_cse_version: get(TemplateKey::MaxCseVersion),
            kind: get(TemplateKey::Kind),
            compute_policy: get(TemplateKey::ComputePolicy),
            deprecated: get(TemplateKey::Deprecated).eq_ignore_ascii_case("true"),
            upgrade_from: get(TemplateKey::UpgradeFrom),
        })
    }
}

pub fn catalog_item_name(name: &str, revision: u32) -> String {
    format!("{name}_rev{revision}")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn metadata_survives_catalog_round_trip() {
        let template = TemplateMetadata {
            name: "ubuntu-20.04_k8-1.21_weave-2.8.1".into(),
            revision: 2,
            kind: "native".into(),
            deprecated: true,
            ..Default::default()
        };
        let metadata = template.to_metadata();
        assert_eq!(metadata.metadata_entry.len(), TemplateKey::ALL.len());
        assert_eq!(TemplateMetadata::from_metadata(&metadata), Some(template));
    }

    #[test]
    fn foreign_catalog_item_is_ignored() {
        let metadata = Metadata {
            metadata_entry: vec![MetadataEntry::string("name", "x")],
        };
        assert_eq!(TemplateMetadata::from_metadata(&metadata), None);
    }

    #[test]
    fn catalog_item_name_has_revision_suffix() {
        assert_eq!(catalog_item_name("photon-v2", 3), "photon-v2_rev3");
    }
}
