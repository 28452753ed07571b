//! Native clusters, read from their defined entities.

use api_types::DefinedEntity;
use api_types::Page;
use api_types::PagedResponse;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use vcd_client::client::with_query;
use vcd_client::config::CLOUDAPI_V1;
use vcd_client::VcdClient;
use vcd_client::VcdError;
use vcd_client::VcdResult;

use crate::install::rde;
use crate::progress::ProgressTask;

/// Row of the cluster list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub id: String,
    pub name: String,
    pub org_name: String,
    pub vdc_name: String,
    pub kubernetes_version: String,
    pub template_name: String,
    pub phase: String,
}

/// First string found at any of `pointers`, for fields whose location
/// differs between RDE 1.0.0 and 2.0.0 documents.
fn field(entity: &Value, pointers: &[&str]) -> String {
    pointers
        .iter()
        .find_map(|p| entity.pointer(p).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

impl ClusterSummary {
    pub fn from_entity(entity: &DefinedEntity) -> Self {
        let doc = &entity.entity;
        Self {
            id: entity.id.clone().unwrap_or_default(),
            name: entity.name.clone(),
            org_name: entity
                .org
                .as_ref()
                .and_then(|o| o.name.clone())
                .unwrap_or_else(|| field(doc, &["/metadata/orgName", "/metadata/org_name"])),
            vdc_name: field(doc, &["/metadata/virtualDataCenterName", "/metadata/ovdc_name"]),
            kubernetes_version: field(doc, &["/status/kubernetes"]),
            template_name: field(
                doc,
                &["/spec/distribution/templateName", "/spec/k8_distribution/template_name"],
            ),
            phase: field(doc, &["/status/phase"]),
        }
    }
}

/// Kubeconfig recorded in the entity status, if the cluster has one.
pub fn kubeconfig(entity: &DefinedEntity) -> Option<String> {
    ["/status/kubeconfig", "/status/private/kubeConfig"]
        .iter()
        .find_map(|p| entity.entity.pointer(p).and_then(Value::as_str))
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// RDE version of native clusters for the client's API version.
pub fn rde_version(client: &VcdClient) -> VcdResult<&'static str> {
    let api_version = client.config().api_version_number()?;
    rde::rde_version_for_api(api_version).ok_or_else(|| {
        Report::new(VcdError::Configuration {
            message: format!("clusters need vCD API 35.0 or later, connected with {api_version}"),
        })
    })
}

/// One page of native clusters visible to `client`.
pub async fn list_clusters(client: &VcdClient, page: u64, page_size: u64) -> VcdResult<PagedResponse<ClusterSummary>> {
    let version = rde_version(client)?;
    let url = with_query(
        &client.cloudapi_url(
            CLOUDAPI_V1,
            &format!(
                "entities/types/{}/{}/{version}",
                rde::NATIVE_ENTITY_VENDOR,
                rde::NATIVE_ENTITY_NSS
            ),
        ),
        &[
            ("page".to_string(), page.to_string()),
            ("pageSize".to_string(), page_size.to_string()),
        ],
    );
    let entities: Page<DefinedEntity> = client.get_json(&url).await?;
    Ok(PagedResponse {
        result_total: entities.result_total,
        page_count: entities.page_count,
        page,
        page_size,
        values: entities.values.iter().map(ClusterSummary::from_entity).collect(),
    })
}

pub async fn get_cluster(client: &VcdClient, cluster_id: &str) -> VcdResult<DefinedEntity> {
    client
        .get_json(&client.cloudapi_url(CLOUDAPI_V1, &format!("entities/{cluster_id}")))
        .await
}

/// Deletes the cluster vApp, then its entity. A vApp that is already
/// gone is not an error.
pub async fn delete_cluster(client: &VcdClient, entity: &DefinedEntity, task: &ProgressTask) -> VcdResult<()> {
    let id = entity.id.clone().unwrap_or_default();
    if let Some(vapp_href) = entity.external_id.as_deref().filter(|h| !h.is_empty()) {
        task.running(&format!("Deleting vApp of cluster {}", entity.name)).await;
        match client
            .delete(&format!("{vapp_href}?force=true&recursive=true"))
            .await
        {
            Ok(response) => {
                if let Some(href) = response.task_href() {
                    client.wait_for_success(&href).await?;
                }
            }
            Err(e) if vcd_client::http_status(&e) == Some(404) => {
                info!(cluster = %entity.name, "Cluster vApp already deleted");
            }
            Err(e) => return Err(e),
        }
    }

    task.running(&format!("Deleting entity of cluster {}", entity.name)).await;
    client
        .delete(&client.cloudapi_url(CLOUDAPI_V1, &format!("entities/{id}")))
        .await
        .attach_printable_lazy(|| format!("cluster {}", entity.name))?;
    info!(cluster = %entity.name, %id, "Deleted cluster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;
    use vcd_client::ClientConfig;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn entity(doc: Value) -> DefinedEntity {
        serde_json::from_value(json!({
            "id": "urn:vcloud:entity:cse:nativeCluster:1",
            "name": "c1",
            "entityType": "urn:vcloud:type:cse:nativeCluster:2.0.0",
            "entity": doc,
        }))
        .expect("entity")
    }

    #[test]
    fn summary_reads_both_layouts() {
        let v1 = entity(json!({
            "metadata": {"org_name": "org", "ovdc_name": "vdc"},
            "spec": {"k8_distribution": {"template_name": "photon"}},
            "status": {"phase": "CREATE:SUCCEEDED", "kubernetes": "1.20"},
        }));
        let v2 = entity(json!({
            "metadata": {"orgName": "org", "virtualDataCenterName": "vdc"},
            "spec": {"distribution": {"templateName": "photon"}},
            "status": {"phase": "CREATE:SUCCEEDED", "kubernetes": "1.20"},
        }));
        assert_eq!(ClusterSummary::from_entity(&v1), ClusterSummary::from_entity(&v2));
        assert_eq!(ClusterSummary::from_entity(&v1).vdc_name, "vdc");
    }

    #[test]
    fn kubeconfig_comes_from_status() {
        assert_eq!(kubeconfig(&entity(json!({"status": {}}))), None);
        assert_eq!(
            kubeconfig(&entity(json!({"status": {"kubeconfig": "apiVersion: v1"}}))),
            Some("apiVersion: v1".to_string())
        );
    }

    #[test(tokio::test)]
    async fn list_uses_the_entity_type_of_the_api_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/1.0.0/entities/types/cse/nativeCluster/2.0.0"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultTotal": 26,
                "pageCount": 2,
                "page": 2,
                "pageSize": 25,
                "values": [{
                    "id": "urn:vcloud:entity:cse:nativeCluster:1",
                    "name": "c1",
                    "entityType": "urn:vcloud:type:cse:nativeCluster:2.0.0",
                    "entity": {"status": {"phase": "CREATE:SUCCEEDED"}},
                }],
            })))
            .mount(&server)
            .await;

        let client = VcdClient::new(ClientConfig::new(server.uri()).with_api_version("36.0"))
            .expect("client")
            .with_token("t");
        let page = list_clusters(&client, 2, 25).await.expect("list");
        assert_eq!(page.result_total, 26);
        assert_eq!(page.values.len(), 1);
        assert_eq!(page.values[0].phase, "CREATE:SUCCEEDED");
    }

    #[test]
    fn old_api_versions_have_no_clusters() {
        let client = VcdClient::new(ClientConfig::new("https://vcd").with_api_version("34.0")).expect("client");
        assert!(rde_version(&client).is_err());
    }
}
