//! Bringing deployed clusters along on upgrade.
//!
//! Clusters deployed by legacy releases are plain vApps tagged with
//! `cse.*` metadata. On the way to a non-legacy release they get the
//! placement policy of their runtime and a defined entity. Clusters that
//! already have entities get them rewritten to the target RDE version.

use std::collections::BTreeMap;

use api_types::DefinedEntity;
use api_types::Metadata;
use api_types::QueryRecord;
use api_types::VApp;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;
use vcd_client::config::CLOUDAPI_V1;
use vcd_client::VcdClient;

use super::error::InstallError;
use super::error::InstallResult;
use super::rde;
use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::K8sRuntime;
use crate::tasks::TaskRunner;

pub const CLUSTER_ID_KEY: &str = "cse.cluster.id";
pub const TEMPLATE_NAME_KEY: &str = "cse.template.name";
pub const TEMPLATE_REVISION_KEY: &str = "cse.template.revision";
pub const KUBERNETES_VERSION_KEY: &str = "cse.kubernetes.version";
pub const CNI_KEY: &str = "cse.cni";
pub const OS_KEY: &str = "cse.os";
pub const DOCKER_VERSION_KEY: &str = "cse.docker.version";

/// A cluster found through its vApp metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyCluster {
    pub name: String,
    pub cluster_id: String,
    pub vapp_href: String,
    pub vdc_id: String,
    pub vdc_name: String,
    pub org_name: String,
    pub template_name: String,
    pub template_revision: u32,
    pub metadata: BTreeMap<String, String>,
}

impl LegacyCluster {
    /// `None` when the vApp isn't a CSE cluster.
    pub fn from_record(record: &QueryRecord, metadata: &Metadata) -> Option<Self> {
        let metadata: BTreeMap<String, String> = metadata
            .metadata_entry
            .iter()
            .map(|e| (e.key.clone(), e.value_string()))
            .collect();
        let cluster_id = metadata.get(CLUSTER_ID_KEY)?.clone();
        Some(Self {
            name: record.name.clone(),
            cluster_id,
            vapp_href: record.href.clone(),
            vdc_id: record
                .vdc
                .as_deref()
                .and_then(|href| href.rsplit('/').next())
                .unwrap_or_default()
                .to_string(),
            vdc_name: record.vdc_name.clone().unwrap_or_default(),
            org_name: record.org_name.clone().unwrap_or_default(),
            template_name: metadata.get(TEMPLATE_NAME_KEY).cloned().unwrap_or_default(),
            template_revision: metadata
                .get(TEMPLATE_REVISION_KEY)
                .and_then(|r| r.parse().ok())
                .unwrap_or_default(),
            metadata,
        })
    }

    pub fn runtime(&self) -> Option<K8sRuntime> {
        K8sRuntime::from_template_name(&self.template_name)
    }

    /// Entity document describing this cluster in the given RDE layout.
    pub fn entity(&self, rde_version: &str) -> Value {
        let get = |key: &str| self.metadata.get(key).cloned().unwrap_or_default();
        let v1 = json!({
            "kind": "native",
            "api_version": "",
            "metadata": {
                "cluster_name": self.name,
                "org_name": self.org_name,
                "ovdc_name": self.vdc_name,
            },
            "spec": {
                "k8_distribution": {
                    "template_name": self.template_name,
                    "template_revision": self.template_revision,
                },
            },
            "status": {
                "phase": "CREATE:SUCCEEDED",
                "kubernetes": get(KUBERNETES_VERSION_KEY),
                "cni": get(CNI_KEY),
                "os": get(OS_KEY),
                "docker_version": get(DOCKER_VERSION_KEY),
            }
        });
        if rde_version == rde::RDE_VERSION_1 {
            v1
        } else {
            rde::migrate_entity_1_to_2(&v1)
        }
    }
}

/// Every vApp carrying the CSE cluster id metadata.
pub async fn discover_legacy_clusters(client: &VcdClient) -> InstallResult<Vec<LegacyCluster>> {
    let records: Vec<QueryRecord> = client
        .query_records::<QueryRecord>("adminVApp", None)
        .try_collect()
        .await
        .change_context(InstallError::vcd("list vApps"))?;

    let mut clusters = Vec::new();
    for record in &records {
        let metadata: Metadata = client
            .get_json(&format!("{}/metadata", record.href))
            .await
            .change_context(InstallError::vcd(format!("read metadata of vApp {}", record.name)))?;
        if let Some(cluster) = LegacyCluster::from_record(record, &metadata) {
            clusters.push(cluster);
        }
    }
    info!(count = clusters.len(), "Discovered deployed clusters");
    Ok(clusters)
}

/// Tags every VM of each cluster with the placement policy of its
/// runtime, attaching the policy to the cluster's VDC first.
pub async fn assign_placement_policies(
    manager: &ComputePolicyManager,
    clusters: &[LegacyCluster],
) -> InstallResult<()> {
    let policies = manager
        .list_policies(true)
        .await
        .change_context(InstallError::vcd("list placement policies"))?;

    for cluster in clusters {
        let Some(runtime) = cluster.runtime() else {
            warn!(cluster = %cluster.name, template = %cluster.template_name, "Unknown runtime, skipping");
            continue;
        };
        let policy = policies
            .iter()
            .find(|p| p.display_name == runtime.policy_display_name())
            .ok_or_else(|| {
                Report::new(InstallError::vcd(format!(
                    "placement policy {} is missing",
                    runtime.policy_display_name()
                )))
            })?;
        manager
            .add_compute_policy_to_vdc(&cluster.vdc_id, &policy.href)
            .await
            .change_context(InstallError::vcd(format!("attach policy to VDC {}", cluster.vdc_name)))?;

        let vapp: VApp = manager
            .client()
            .get_json(&cluster.vapp_href)
            .await
            .change_context(InstallError::vcd(format!("read vApp {}", cluster.name)))?;
        for vm in vapp.vms() {
            manager
                .assign_placement_policy_to_vm(vm, policy)
                .await
                .change_context(InstallError::vcd(format!("tag VMs of cluster {}", cluster.name)))?;
        }
        info!(cluster = %cluster.name, runtime = runtime.label(), "Assigned placement policy to cluster");
    }
    Ok(())
}

fn entities_url(client: &VcdClient, path: &str) -> String {
    client.cloudapi_url(CLOUDAPI_V1, path)
}

async fn resolve(client: &VcdClient, entity_id: &str) -> InstallResult<()> {
    client
        .post(&entities_url(client, &format!("entities/{entity_id}/resolve")), &json!({}))
        .await
        .change_context(InstallError::vcd(format!("resolve entity {entity_id}")))?;
    Ok(())
}

fn entities_of_type<'a>(
    client: &'a VcdClient,
    version: &str,
    name: Option<&str>,
) -> impl futures::Stream<Item = vcd_client::VcdResult<DefinedEntity>> + 'a {
    let path = format!(
        "entities/types/{}/{}/{version}",
        rde::NATIVE_ENTITY_VENDOR,
        rde::NATIVE_ENTITY_NSS
    );
    let query = name
        .map(|n| vec![("filter".to_string(), vcd_client::construct_filter_string(&[("name", n)]))])
        .unwrap_or_default();
    client.paginate::<DefinedEntity>(entities_url(client, &path), query)
}

async fn create_entity(client: &VcdClient, cluster: &LegacyCluster, rde_version: &str) -> InstallResult<()> {
    let type_id = rde::entity_type_id(rde_version);
    let response = client
        .post(
            &entities_url(client, &format!("entityTypes/{type_id}")),
            &json!({
                "name": cluster.name,
                "externalId": cluster.vapp_href,
                "entity": cluster.entity(rde_version),
            }),
        )
        .await
        .change_context(InstallError::vcd(format!("create entity for {}", cluster.name)))?;
    if let Some(task) = response.task_href() {
        client
            .wait_for_success(&task)
            .await
            .change_context(InstallError::vcd(format!("create entity for {}", cluster.name)))?;
    }

    let created = entities_of_type(client, rde_version, Some(&cluster.name))
        .boxed()
        .try_next()
        .await
        .change_context(InstallError::vcd("find created entity"))?
        .and_then(|e| e.id)
        .ok_or_else(|| Report::new(InstallError::vcd(format!("entity of {} not found", cluster.name))))?;
    resolve(client, &created).await?;
    info!(cluster = %cluster.name, entity = %created, "Created cluster entity");
    Ok(())
}

async fn migrate_entity(client: &VcdClient, mut entity: DefinedEntity, from: &str, to: &str) -> InstallResult<()> {
    let id = entity
        .id
        .clone()
        .ok_or_else(|| Report::new(InstallError::vcd(format!("entity {} has no id", entity.name))))?;
    if from == rde::RDE_VERSION_1 && to == rde::RDE_VERSION_2 {
        entity.entity = rde::migrate_entity_1_to_2(&entity.entity);
    } else {
        return Err(Report::new(InstallError::Rde {
            message: format!("no migration from RDE {from} to {to}"),
        }));
    }
    entity.entity_type = rde::entity_type_id(to);
    client
        .put(&entities_url(client, &format!("entities/{id}")), &entity)
        .await
        .change_context(InstallError::vcd(format!("update entity {id}")))?;
    resolve(client, &id).await?;
    info!(entity = %id, cluster = %entity.name, "Migrated cluster entity");
    Ok(())
}

/// Outcome of a batch run on the task runner.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Report<InstallError>)>,
}

impl BatchSummary {
    pub fn into_result(self, what: &str) -> InstallResult<Vec<String>> {
        let Some((first_name, first)) = self.failed.into_iter().next() else {
            return Ok(self.succeeded);
        };
        Err(first.attach_printable(format!("{what} of {first_name} failed")))
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<(String, InstallResult<()>)>) -> BatchSummary {
    let mut summary = BatchSummary::default();
    while let Some((name, result)) = rx.recv().await {
        match result {
            Ok(()) => summary.succeeded.push(name),
            Err(e) => {
                warn!(%name, "Cluster step failed: {e:?}");
                summary.failed.push((name, e));
            }
        }
    }
    summary
}

/// Creates entities for clusters that have none, one runner job each.
pub async fn create_entities_for_legacy_clusters(
    client: &VcdClient,
    runner: &TaskRunner,
    clusters: Vec<LegacyCluster>,
    rde_version: &str,
) -> BatchSummary {
    let (tx, rx) = mpsc::unbounded_channel();
    for cluster in clusters {
        let client = client.clone();
        let tx = tx.clone();
        let rde_version = rde_version.to_string();
        runner.spawn(&format!("create-entity-{}", cluster.name), move |token| async move {
            let result = if token.is_cancelled() {
                Err(Report::new(InstallError::vcd("entity creation cancelled by shutdown")))
            } else {
                create_entity(&client, &cluster, &rde_version).await
            };
            let _ = tx.send((cluster.name, result));
        });
    }
    drop(tx);
    collect(rx).await
}

/// Rewrites every entity of RDE version `from` to `to`, one runner job
/// per entity.
pub async fn migrate_cluster_entities(
    client: &VcdClient,
    runner: &TaskRunner,
    from: &str,
    to: &str,
) -> InstallResult<BatchSummary> {
    let entities: Vec<DefinedEntity> = entities_of_type(client, from, None)
        .try_collect()
        .await
        .change_context(InstallError::vcd(format!("list entities of RDE {from}")))?;

    let (tx, rx) = mpsc::unbounded_channel();
    for entity in entities {
        let client = client.clone();
        let tx = tx.clone();
        let (from, to) = (from.to_string(), to.to_string());
        runner.spawn(&format!("migrate-entity-{}", entity.name), move |token| async move {
            let name = entity.name.clone();
            let result = if token.is_cancelled() {
                Err(Report::new(InstallError::vcd("entity migration cancelled by shutdown")))
            } else {
                migrate_entity(&client, entity, &from, &to).await
            };
            let _ = tx.send((name, result));
        });
    }
    drop(tx);
    Ok(collect(rx).await)
}

#[cfg(test)]
mod tests {
    use api_types::MetadataEntry;
    use similar_asserts::assert_eq;

    use super::*;

    fn record() -> QueryRecord {
        QueryRecord {
            href: "https://vcd/api/vApp/vapp-1".into(),
            name: "c1".into(),
            vdc: Some("https://vcd/api/vdc/vdc-9".into()),
            vdc_name: Some("ovdc".into()),
            org_name: Some("org".into()),
            ..Default::default()
        }
    }

    fn metadata(entries: &[(&str, &str)]) -> Metadata {
        Metadata {
            metadata_entry: entries
                .iter()
                .map(|(k, v)| MetadataEntry::string(*k, *v))
                .collect(),
        }
    }

    #[test]
    fn vapp_without_cluster_id_is_not_a_cluster() {
        assert_eq!(
            LegacyCluster::from_record(&record(), &metadata(&[("other", "x")])),
            None
        );
    }

    #[test]
    fn cluster_is_read_from_metadata() {
        let cluster = LegacyCluster::from_record(
            &record(),
            &metadata(&[
                (CLUSTER_ID_KEY, "id-1"),
                (TEMPLATE_NAME_KEY, "ubuntu-16.04_k8-1.18_weave-2.6.5"),
                (TEMPLATE_REVISION_KEY, "2"),
            ]),
        )
        .expect("cluster");
        assert_eq!(cluster.vdc_id, "vdc-9");
        assert_eq!(cluster.template_revision, 2);
        assert_eq!(cluster.runtime(), Some(K8sRuntime::Native));
    }

    #[test]
    fn entity_follows_rde_version() {
        let cluster = LegacyCluster::from_record(
            &record(),
            &metadata(&[(CLUSTER_ID_KEY, "id-1"), (TEMPLATE_NAME_KEY, "photon-tkg")]),
        )
        .expect("cluster");
        assert_eq!(cluster.runtime(), Some(K8sRuntime::TkgPlus));

        let v1 = cluster.entity(rde::RDE_VERSION_1);
        assert_eq!(v1["metadata"]["cluster_name"], "c1");
        let v2 = cluster.entity(rde::RDE_VERSION_2);
        assert_eq!(v2["metadata"]["name"], "c1");
        assert_eq!(v2["spec"]["distribution"]["templateName"], "photon-tkg");
    }
}
