//! NSX-T management API, limited to the objects that isolate PKS cluster
//! networks: IP sets, NSGroups and one distributed firewall section.

use error_stack::Report;
use error_stack::ResultExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use utils::logging::WIRE_TARGET;

use super::error::PksError;
use super::error::PksResult;
use crate::config::pks::NsxtServer;

pub const NODES_IP_SET: &str = "cse-pks-nodes-ip-set";
pub const PODS_IP_SET: &str = "cse-pks-pods-ip-set";
pub const NODES_NS_GROUP: &str = "cse-pks-nodes";
pub const PODS_NS_GROUP: &str = "cse-pks-pods";
pub const FIREWALL_SECTION: &str = "cse-pks-isolation";
pub const ALLOW_NODES_TO_PODS_RULE: &str = "cse-pks-allow-nodes-to-pods";
pub const DROP_TO_PODS_RULE: &str = "cse-pks-drop-to-pods";

/// Any NSX-T object, by id and display name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NsxtResource {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NsxtClient {
    name: String,
    base: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl NsxtClient {
    pub fn new(server: &NsxtServer) -> PksResult<Self> {
        let misconfigured = || PksError::NsxtConfiguration {
            server: server.name.clone(),
        };
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!server.verify);
        if let Some(proxy) = &server.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).change_context_lazy(misconfigured)?);
        }
        let http = builder.build().change_context_lazy(misconfigured)?;

        let host = server.host.trim_end_matches('/');
        let base = if host.contains("://") {
            format!("{host}/api/v1")
        } else {
            format!("https://{host}/api/v1")
        };
        Ok(Self {
            name: server.name.clone(),
            base,
            username: server.username.clone(),
            password: server.password.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> PksResult<T> {
        let url = self.url(path);
        let failed = || PksError::Nsxt {
            server: self.name.clone(),
            operation: format!("{method} {path}"),
        };
        debug!(target: WIRE_TARGET, %method, %url, body = ?body, "request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.change_context_lazy(failed)?;
        let status = response.status();
        let text = response.text().await.change_context_lazy(failed)?;
        debug!(target: WIRE_TARGET, %method, %url, status = status.as_u16(), body = %text, "response");

        if !status.is_success() {
            return Err(Report::new(failed()).attach_printable(format!("status {status}: {text}")));
        }
        serde_json::from_str(if text.trim().is_empty() { "null" } else { &text })
            .change_context_lazy(failed)
    }

    /// Every object of a collection, following `cursor`.
    pub async fn list(&self, path: &str) -> PksResult<Vec<NsxtResource>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let query: Vec<(&str, &str)> = cursor.as_deref().map(|c| ("cursor", c)).into_iter().collect();
            let page: ListResult<NsxtResource> = self.request(Method::GET, path, &query, None).await?;
            all.extend(page.results);
            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(all)
    }

    pub async fn find(&self, path: &str, display_name: &str) -> PksResult<Option<NsxtResource>> {
        Ok(self
            .list(path)
            .await?
            .into_iter()
            .find(|r| r.display_name == display_name))
    }

    async fn ensure(
        &self,
        path: &str,
        display_name: &str,
        query: &[(&str, &str)],
        body: Value,
    ) -> PksResult<NsxtResource> {
        if let Some(existing) = self.find(path, display_name).await? {
            debug!(server = %self.name, path, display_name, "NSX-T object exists");
            return Ok(existing);
        }
        let created: NsxtResource = self.request(Method::POST, path, query, Some(&body)).await?;
        info!(server = %self.name, path, display_name, id = %created.id, "Created NSX-T object");
        Ok(created)
    }

    pub async fn ensure_ip_set(&self, name: &str, cidrs: &[String]) -> PksResult<NsxtResource> {
        self.ensure(
            "ip-sets",
            name,
            &[],
            json!({"display_name": name, "ip_addresses": cidrs}),
        )
        .await
    }

    /// NSGroup whose only member is the IP set `ip_set_id`.
    pub async fn ensure_ns_group(&self, name: &str, ip_set_id: &str) -> PksResult<NsxtResource> {
        self.ensure(
            "ns-groups",
            name,
            &[],
            json!({
                "display_name": name,
                "members": [{
                    "resource_type": "NSGroupSimpleExpression",
                    "target_type": "IPSet",
                    "target_property": "id",
                    "op": "EQUALS",
                    "value": ip_set_id,
                }],
            }),
        )
        .await
    }

    /// Layer 3 section placed right before the `anchor_id` section.
    pub async fn ensure_firewall_section(&self, name: &str, anchor_id: &str) -> PksResult<NsxtResource> {
        self.ensure(
            "firewall/sections",
            name,
            &[("operation", "insert_before"), ("id", anchor_id)],
            json!({"display_name": name, "section_type": "LAYER3", "stateful": true}),
        )
        .await
    }

    /// Rule from the `source` NSGroup (any when `None`) to `destination`.
    pub async fn ensure_rule(
        &self,
        section_id: &str,
        name: &str,
        source: Option<&NsxtResource>,
        destination: &NsxtResource,
        action: &str,
    ) -> PksResult<NsxtResource> {
        let target = |group: &NsxtResource| {
            json!({"target_type": "NSGroup", "target_id": group.id, "target_display_name": group.display_name})
        };
        let sources: Vec<Value> = source.map(target).into_iter().collect();
        self.ensure(
            &format!("firewall/sections/{section_id}/rules"),
            name,
            &[],
            json!({
                "display_name": name,
                "action": action,
                "direction": "IN_OUT",
                "ip_protocol": "IPV4_IPV6",
                "sources": sources,
                "destinations": [target(destination)],
            }),
        )
        .await
    }
}

/// Groups PKS node and pod networks and fences the pods off from anything
/// but the nodes. Every step is idempotent.
pub async fn isolate_pks_networks(client: &NsxtClient, server: &NsxtServer) -> PksResult<NsxtResource> {
    let nodes_ip_set = client.ensure_ip_set(NODES_IP_SET, &server.nodes_ip_block).await?;
    let pods_ip_set = client.ensure_ip_set(PODS_IP_SET, &server.pods_ip_block).await?;
    let nodes = client.ensure_ns_group(NODES_NS_GROUP, &nodes_ip_set.id).await?;
    let pods = client.ensure_ns_group(PODS_NS_GROUP, &pods_ip_set.id).await?;

    let section = client
        .ensure_firewall_section(FIREWALL_SECTION, &server.distributed_firewall_section_anchor_id)
        .await?;
    // Rules are evaluated top down; the allow rule has to exist first.
    client
        .ensure_rule(&section.id, ALLOW_NODES_TO_PODS_RULE, Some(&nodes), &pods, "ALLOW")
        .await?;
    client
        .ensure_rule(&section.id, DROP_TO_PODS_RULE, None, &pods, "DROP")
        .await?;
    info!(server = %server.name, section = %section.id, "PKS networks isolated");
    Ok(section)
}
