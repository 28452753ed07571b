//! Catalog holding CSE templates.

use api_types::Metadata;
use api_types::QueryRecord;
use api_types::Reference;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;
use vcd_client::VcdResponse;

use super::error::TemplateError;
use super::error::TemplateResult;
use super::metadata::TemplateMetadata;

/// Catalog item as returned by the legacy API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entity: Option<Reference>,
}

/// A catalog of one org, addressed by name.
#[derive(Debug, Clone)]
pub struct Catalog {
    client: VcdClient,
    org: String,
    name: String,
    href: String,
}

impl Catalog {
    /// Opens an existing catalog.
    pub async fn open(client: VcdClient, org: &str, name: &str) -> TemplateResult<Self> {
        let href = find_catalog_href(&client, org, name).await?.ok_or_else(|| {
            Report::new(TemplateError::CatalogNotFound {
                org: org.to_string(),
                catalog: name.to_string(),
            })
        })?;
        Ok(Self {
            client,
            org: org.to_string(),
            name: name.to_string(),
            href,
        })
    }

    /// Opens the catalog, creating it in the org first if needed.
    pub async fn open_or_create(client: VcdClient, org: &str, name: &str) -> TemplateResult<Self> {
        if let Some(href) = find_catalog_href(&client, org, name).await? {
            return Ok(Self {
                client,
                org: org.to_string(),
                name: name.to_string(),
                href,
            });
        }

        let org_record = client
            .query_records::<QueryRecord>(
                "organization",
                Some(construct_filter_string(&[("name", org)])),
            )
            .boxed()
            .try_next()
            .await
            .change_context(TemplateError::vcd(format!("look up org {org}")))?
            .ok_or_else(|| Report::new(TemplateError::vcd(format!("org '{org}' not found"))))?;
        let url = client.api_url(&format!("admin/org/{}/catalogs", org_record.uuid()));
        let response = client
            .post(
                &url,
                &json!({"name": name, "description": "CSE Kubernetes templates"}),
            )
            .await
            .change_context(TemplateError::vcd(format!("create catalog {name}")))?;
        wait(&client, &response, &format!("create catalog {name}")).await?;
        info!(org, catalog = name, "Created catalog");

        Self::open(client, org, name).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn client(&self) -> &VcdClient {
        &self.client
    }

    /// Tenant view href, the one catalog actions are posted to.
    pub fn href(&self) -> &str {
        &self.href
    }

    pub async fn items(&self) -> TemplateResult<Vec<QueryRecord>> {
        self.client
            .query_records::<QueryRecord>(
                "adminCatalogItem",
                Some(construct_filter_string(&[
                    ("catalogName", self.name.as_str()),
                    ("orgName", self.org.as_str()),
                ])),
            )
            .try_collect()
            .await
            .change_context(TemplateError::vcd(format!("list items of catalog {}", self.name)))
    }

    pub async fn find_item(&self, item_name: &str) -> TemplateResult<Option<QueryRecord>> {
        Ok(self.items().await?.into_iter().find(|i| i.name == item_name))
    }

    pub async fn item_metadata(&self, item_href: &str) -> TemplateResult<Metadata> {
        self.client
            .get_json(&format!("{item_href}/metadata"))
            .await
            .change_context(TemplateError::vcd("read catalog item metadata"))
    }

    /// Templates installed in the catalog, i.e. items carrying template
    /// metadata.
    pub async fn templates(&self) -> TemplateResult<Vec<TemplateMetadata>> {
        let mut templates = Vec::new();
        for item in self.items().await? {
            let metadata = self.item_metadata(&item.href).await?;
            match TemplateMetadata::from_metadata(&metadata) {
                Some(template) => templates.push(template),
                None => debug!(item = %item.name, "Catalog item is not a CSE template"),
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name).then(a.revision.cmp(&b.revision)));
        Ok(templates)
    }

    pub async fn set_metadata(&self, item_href: &str, template: &TemplateMetadata) -> TemplateResult<()> {
        let response = self
            .client
            .post(&format!("{item_href}/metadata"), &template.to_metadata())
            .await
            .change_context(TemplateError::vcd("write catalog item metadata"))?;
        wait(&self.client, &response, "write catalog item metadata").await
    }

    /// Returns whether an item was deleted.
    pub async fn delete_item(&self, item_name: &str) -> TemplateResult<bool> {
        let Some(item) = self.find_item(item_name).await? else {
            return Ok(false);
        };
        let response = self
            .client
            .delete(&item.href)
            .await
            .change_context(TemplateError::vcd(format!("delete catalog item {item_name}")))?;
        wait(&self.client, &response, &format!("delete catalog item {item_name}")).await?;
        info!(catalog = %self.name, item = item_name, "Deleted catalog item");
        Ok(true)
    }

    /// Captures a powered off vApp as a new catalog item, returning the item
    /// href.
    pub async fn capture_vapp(&self, vapp_href: &str, item_name: &str, description: &str) -> TemplateResult<String> {
        let response = self
            .client
            .post(
                &format!("{}/action/captureVApp", self.href),
                &json!({
                    "name": item_name,
                    "description": description,
                    "source": {"href": vapp_href},
                    "customizationSection": {"customizeOnInstantiate": true},
                }),
            )
            .await
            .change_context(TemplateError::vcd(format!("capture vApp as {item_name}")))?;
        wait(&self.client, &response, &format!("capture vApp as {item_name}")).await?;
        let item = self.find_item(item_name).await?.ok_or_else(|| {
            Report::new(TemplateError::vcd(format!("captured item {item_name} not found")))
        })?;
        info!(catalog = %self.name, item = item_name, "Captured vApp template");
        Ok(item.href)
    }
}

async fn find_catalog_href(client: &VcdClient, org: &str, name: &str) -> TemplateResult<Option<String>> {
    let record = client
        .query_records::<QueryRecord>(
            "adminCatalog",
            Some(construct_filter_string(&[("name", name), ("orgName", org)])),
        )
        .boxed()
        .try_next()
        .await
        .change_context(TemplateError::vcd(format!("look up catalog {name}")))?;
    Ok(record.map(|r| tenant_href(&r.href)))
}

/// `.../api/admin/catalog/{id}` -> `.../api/catalog/{id}`
pub fn tenant_href(href: &str) -> String {
    href.replace("/api/admin/catalog/", "/api/catalog/")
}

/// Waits on the task an asynchronous legacy call answered with, if any.
pub(crate) async fn wait(client: &VcdClient, response: &VcdResponse, operation: &str) -> TemplateResult<()> {
    match response.task_href() {
        Some(href) => {
            client
                .wait_for_success(&href)
                .await
                .change_context(TemplateError::vcd(operation.to_string()))?;
        }
        None if response.status == 202 => {
            warn!(operation, "Accepted without a task to follow");
        }
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
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

    fn client(server: &MockServer) -> VcdClient {
        VcdClient::new(ClientConfig::new(server.uri()))
            .expect("client")
            .with_token("t")
    }

    async fn mount_query(server: &MockServer, query_type: &str, records: serde_json::Value) {
        let total = records.as_array().map(Vec::len).unwrap_or_default();
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("type", query_type))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": total,
                "page": 1,
                "pageSize": 25,
                "record": records,
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn admin_href_is_turned_into_tenant_href() {
        assert_eq!(
            tenant_href("https://vcd/api/admin/catalog/123"),
            "https://vcd/api/catalog/123"
        );
    }

    #[test(tokio::test)]
    async fn missing_catalog_is_reported() {
        let server = MockServer::start().await;
        mount_query(&server, "adminCatalog", json!([])).await;
        let err = Catalog::open(client(&server), "system", "cse")
            .await
            .expect_err("missing");
        assert!(matches!(
            err.current_context(),
            TemplateError::CatalogNotFound { .. }
        ));
    }

    #[test(tokio::test)]
    async fn templates_skip_foreign_items() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount_query(
            &server,
            "adminCatalog",
            json!([{"href": format!("{base}/api/admin/catalog/c1"), "name": "cse"}]),
        )
        .await;
        mount_query(
            &server,
            "adminCatalogItem",
            json!([
                {"href": format!("{base}/api/catalogItem/i1"), "name": "photon-v2_rev1"},
                {"href": format!("{base}/api/catalogItem/i2"), "name": "notes"},
            ]),
        )
        .await;
        let template = TemplateMetadata {
            name: "photon-v2".into(),
            revision: 1,
            ..Default::default()
        };
        Mock::given(method("GET"))
            .and(path("/api/catalogItem/i1/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(template.to_metadata()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/catalogItem/i2/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"metadataEntry": []})))
            .mount(&server)
            .await;

        let catalog = Catalog::open(client(&server), "system", "cse").await.expect("open");
        assert_eq!(catalog.href(), format!("{base}/api/catalog/c1"));
        assert_eq!(catalog.templates().await.expect("templates"), vec![template]);
    }
}
