//! PKS (Enterprise PKS) wiring: org VDCs backed by a PKS provider VDC are
//! tagged with the PKS server they use, and NSX-T is set up to isolate PKS
//! cluster networks.

pub mod error;
pub mod nsxt;

use std::collections::BTreeMap;

use api_types::Metadata;
use api_types::MetadataEntry;
use api_types::QueryRecord;
use error_stack::ResultExt;
use futures::TryStreamExt;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;

pub use error::PksError;
pub use error::PksResult;

use crate::config::pks::PksApiServer;
use crate::config::pks::PksPvdc;
use crate::config::PksConfig;

pub const K8S_PROVIDER_KEY: &str = "k8s_provider";
pub const PKS_PROVIDER: &str = "ent-pks";
pub const PKS_API_SERVER_KEY: &str = "pks_api_server";
pub const PKS_VC_KEY: &str = "pks_vc";
pub const PKS_DATACENTER_KEY: &str = "pks_datacenter";
pub const PKS_CLUSTER_KEY: &str = "pks_cluster";
pub const PKS_CPI_KEY: &str = "pks_cpi";
pub const PKS_ACCOUNTS_KEY: &str = "pks_accounts";
pub const PKS_COMPUTE_PROFILE_KEY: &str = "pks_compute_profile_name";

/// Compute profile PKS uses for clusters of one org VDC.
pub fn compute_profile_name(vdc_uuid: &str) -> String {
    format!("cp--{vdc_uuid}")
}

/// Metadata stamped on one org VDC, or `None` when the org is not
/// allowed to use PKS.
///
/// With an `orgs` section only the listed orgs get PKS, with their own
/// accounts; without one every org gets every account of the server's
/// vCenter.
pub fn ovdc_metadata(
    pks: &PksConfig,
    server: &PksApiServer,
    pvdc: &PksPvdc,
    org_name: &str,
    vdc_uuid: &str,
) -> Option<BTreeMap<String, String>> {
    let accounts: Vec<&str> = if pks.orgs.is_empty() {
        pks.pks_accounts
            .iter()
            .filter(|a| a.vc == server.vc)
            .map(|a| a.name.as_str())
            .collect()
    } else {
        let org = pks.orgs.iter().find(|o| o.name == org_name)?;
        pks.pks_accounts
            .iter()
            .filter(|a| a.vc == server.vc && org.pks_accounts.contains(&a.name))
            .map(|a| a.name.as_str())
            .collect()
    };
    if accounts.is_empty() {
        return None;
    }

    Some(BTreeMap::from([
        (K8S_PROVIDER_KEY.to_string(), PKS_PROVIDER.to_string()),
        (PKS_API_SERVER_KEY.to_string(), server.name.clone()),
        (PKS_VC_KEY.to_string(), server.vc.clone()),
        (PKS_DATACENTER_KEY.to_string(), server.datacenter.clone()),
        (PKS_CLUSTER_KEY.to_string(), pvdc.cluster.clone()),
        (PKS_CPI_KEY.to_string(), server.cpi.clone()),
        (PKS_ACCOUNTS_KEY.to_string(), accounts.join(",")),
        (PKS_COMPUTE_PROFILE_KEY.to_string(), compute_profile_name(vdc_uuid)),
    ]))
}

/// Outcome of `pks-configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PksSummary {
    /// `org/vdc` of every tagged org VDC.
    pub ovdcs: Vec<String>,
    /// NSX-T server name and id of its isolation firewall section.
    pub firewall_sections: Vec<(String, String)>,
}

async fn write_metadata(client: &VcdClient, vdc_href: &str, entries: &BTreeMap<String, String>) -> PksResult<()> {
    let metadata = Metadata {
        metadata_entry: entries
            .iter()
            .map(|(k, v)| MetadataEntry::string(k, v))
            .collect(),
    };
    let operation = || PksError::vcd(format!("write PKS metadata on {vdc_href}"));
    let response = client
        .post(&format!("{vdc_href}/metadata"), &metadata)
        .await
        .change_context_lazy(operation)?;
    if let Some(task) = response.task_href() {
        client.wait_for_success(&task).await.change_context_lazy(operation)?;
    }
    Ok(())
}

/// Tags every org VDC backed by a PKS provider VDC.
pub async fn configure_ovdcs(client: &VcdClient, pks: &PksConfig) -> PksResult<Vec<String>> {
    let mut configured = Vec::new();
    for pvdc in &pks.pvdcs {
        let Some(server) = pks.api_server(&pvdc.pks_api_server) else {
            warn!(pvdc = %pvdc.name, server = %pvdc.pks_api_server, "Unknown PKS API server, skipping");
            continue;
        };
        let ovdcs: Vec<QueryRecord> = client
            .query_records::<QueryRecord>(
                "adminOrgVdc",
                Some(construct_filter_string(&[("providerVdcName", pvdc.name.as_str())])),
            )
            .try_collect()
            .await
            .change_context_lazy(|| PksError::vcd(format!("list org VDCs of provider VDC {}", pvdc.name)))?;
        if ovdcs.is_empty() {
            warn!(pvdc = %pvdc.name, "Provider VDC backs no org VDC");
        }

        for ovdc in ovdcs {
            let org_name = ovdc.org_name.clone().unwrap_or_default();
            let Some(entries) = ovdc_metadata(pks, server, pvdc, &org_name, ovdc.uuid()) else {
                debug!(org = %org_name, vdc = %ovdc.name, "Org has no PKS account, skipping");
                continue;
            };
            write_metadata(client, &ovdc.href, &entries).await?;
            info!(org = %org_name, vdc = %ovdc.name, server = %server.name, "Configured org VDC for PKS");
            configured.push(format!("{org_name}/{}", ovdc.name));
        }
    }
    Ok(configured)
}

/// Org VDC metadata first, then network isolation on every NSX-T server.
pub async fn configure(client: &VcdClient, pks: &PksConfig) -> PksResult<PksSummary> {
    let ovdcs = configure_ovdcs(client, pks).await?;
    let mut firewall_sections = Vec::new();
    for server in &pks.nsxt_servers {
        let nsxt = nsxt::NsxtClient::new(server)?;
        let section = nsxt::isolate_pks_networks(&nsxt, server).await?;
        firewall_sections.push((server.name.clone(), section.id));
    }
    Ok(PksSummary {
        ovdcs,
        firewall_sections,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;
    use vcd_client::ClientConfig;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;
    use crate::config::pks::PksAccount;
    use crate::config::pks::PksOrg;

    fn pks_config() -> PksConfig {
        PksConfig {
            pks_api_servers: vec![PksApiServer {
                name: "pks-1".into(),
                host: "pks.local".into(),
                port: 9021,
                uaac_port: 8443,
                datacenter: "dc".into(),
                clusters: vec!["c1".into()],
                cpi: "cpi-1".into(),
                vc: "vc1".into(),
                verify: true,
                proxy: None,
            }],
            pks_accounts: vec![
                PksAccount {
                    name: "acct-a".into(),
                    vc: "vc1".into(),
                    username: "u".into(),
                    secret: "s".into(),
                },
                PksAccount {
                    name: "acct-b".into(),
                    vc: "vc1".into(),
                    username: "u".into(),
                    secret: "s".into(),
                },
                PksAccount {
                    name: "acct-other-vc".into(),
                    vc: "vc2".into(),
                    username: "u".into(),
                    secret: "s".into(),
                },
            ],
            orgs: Vec::new(),
            pvdcs: vec![PksPvdc {
                name: "pvdc-1".into(),
                pks_api_server: "pks-1".into(),
                cluster: "c1".into(),
            }],
            nsxt_servers: Vec::new(),
        }
    }

    #[test]
    fn without_orgs_every_account_of_the_vcenter_is_used() {
        let pks = pks_config();
        let entries = ovdc_metadata(&pks, &pks.pks_api_servers[0], &pks.pvdcs[0], "org", "vdc-1")
            .expect("metadata");
        assert_eq!(entries[PKS_ACCOUNTS_KEY], "acct-a,acct-b");
        assert_eq!(entries[K8S_PROVIDER_KEY], PKS_PROVIDER);
        assert_eq!(entries[PKS_COMPUTE_PROFILE_KEY], "cp--vdc-1");
        assert_eq!(entries[PKS_CLUSTER_KEY], "c1");
    }

    #[test]
    fn orgs_section_restricts_orgs_and_accounts() {
        let mut pks = pks_config();
        pks.orgs = vec![PksOrg {
            name: "org".into(),
            pks_accounts: vec!["acct-b".into()],
        }];
        let server = &pks.pks_api_servers[0];
        let pvdc = &pks.pvdcs[0];
        let entries = ovdc_metadata(&pks, server, pvdc, "org", "v").expect("metadata");
        assert_eq!(entries[PKS_ACCOUNTS_KEY], "acct-b");
        assert!(ovdc_metadata(&pks, server, pvdc, "other", "v").is_none());
    }

    #[test(tokio::test)]
    async fn backed_org_vdcs_are_tagged() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("type", "adminOrgVdc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 1,
                "page": 1,
                "pageSize": 25,
                "record": [{
                    "href": format!("{base}/api/admin/vdc/v1"),
                    "name": "ovdc-1",
                    "orgName": "org",
                }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/admin/vdc/v1/metadata"))
            .and(body_partial_json(json!({
                "metadataEntry": [{"key": K8S_PROVIDER_KEY}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = VcdClient::new(ClientConfig::new(base)).expect("client").with_token("t");
        let configured = configure_ovdcs(&client, &pks_config()).await.expect("configure");
        assert_eq!(configured, vec!["org/ovdc-1".to_string()]);
    }
}
