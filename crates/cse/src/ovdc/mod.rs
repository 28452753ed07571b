//! Org VDC views and kubernetes runtime enablement.

pub mod reconcile;

use api_types::PagedResponse;
use api_types::QueryRecords;
use api_types::QueryRecord;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use serde::Serialize;
use vcd_client::client::with_query;
use vcd_client::VcdClient;

use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::CsePolicyName;
use crate::compute_policy::PolicyError;
use crate::compute_policy::PolicyResult;

const VDC_URN_PREFIX: &str = "urn:vcloud:vdc:";

/// `urn:vcloud:vdc:<uuid>` for either form of VDC id.
pub fn vdc_urn(id: &str) -> String {
    if id.starts_with(VDC_URN_PREFIX) {
        id.to_string()
    } else {
        format!("{VDC_URN_PREFIX}{id}")
    }
}

/// Bare uuid for either form of VDC id.
pub fn vdc_uuid(id: &str) -> &str {
    id.strip_prefix(VDC_URN_PREFIX).unwrap_or(id)
}

/// Org VDC with the kubernetes runtimes enabled on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OvdcInfo {
    pub name: String,
    pub id: String,
    pub org_name: String,
    pub k8s_runtime: Vec<String>,
}

/// CSE placement policies assigned to a VDC, by display name.
pub async fn enabled_runtimes(manager: &ComputePolicyManager, vdc_id: &str) -> PolicyResult<Vec<String>> {
    let mut runtimes: Vec<String> = manager
        .list_vdc_placement_policies(vdc_id)
        .try_filter_map(|p| async move {
            Ok(CsePolicyName::from_stored(&p.name).map(|n| n.display_name().to_string()))
        })
        .try_collect()
        .await?;
    runtimes.sort();
    Ok(runtimes)
}

/// One page of org VDCs, mirroring vCD's `page`/`pageSize` convention.
pub async fn list_ovdcs(
    manager: &ComputePolicyManager,
    page: u64,
    page_size: u64,
) -> PolicyResult<PagedResponse<OvdcInfo>> {
    let client = manager.client();
    let url = with_query(
        &client.api_url("query"),
        &[
            ("type".to_string(), "adminOrgVdc".to_string()),
            ("format".to_string(), "records".to_string()),
            ("page".to_string(), page.to_string()),
            ("pageSize".to_string(), page_size.to_string()),
        ],
    );
    let records: QueryRecords<QueryRecord> = match client.get_json(&url).await {
        Ok(records) => records,
        // vCD answers past-the-end pages with 400
        Err(e) if vcd_client::http_status(&e) == Some(400) && page > 1 => QueryRecords {
            total: 0,
            page,
            page_size,
            record: Vec::new(),
        },
        Err(e) => return Err(e.change_context(PolicyError::vcd("list org VDCs"))),
    };

    let mut values = Vec::with_capacity(records.record.len());
    for record in &records.record {
        values.push(ovdc_info(manager, record).await?);
    }

    let total = records.total.max(values.len() as u64);
    Ok(PagedResponse {
        result_total: total,
        page_count: total.div_ceil(page_size.max(1)),
        page,
        page_size,
        values,
    })
}

async fn ovdc_info(manager: &ComputePolicyManager, record: &QueryRecord) -> PolicyResult<OvdcInfo> {
    let id = record.uuid().to_string();
    let k8s_runtime = if manager.is_pvdc_policy_supported() {
        enabled_runtimes(manager, &id).await?
    } else {
        Vec::new()
    };
    Ok(OvdcInfo {
        name: record.name.clone(),
        id,
        org_name: record.org_name.clone().unwrap_or_default(),
        k8s_runtime,
    })
}

/// Details of a single org VDC.
pub async fn get_ovdc(manager: &ComputePolicyManager, vdc_id: &str) -> PolicyResult<OvdcInfo> {
    let client: &VcdClient = manager.client();
    let vdc: api_types::Reference = client
        .get_json(&client.api_url(&format!("admin/vdc/{}", vdc_uuid(vdc_id))))
        .await
        .change_context(PolicyError::vcd(format!("read org VDC {vdc_id}")))?;

    let org_name = client
        .query_records::<QueryRecord>(
            "adminOrgVdc",
            Some(vcd_client::construct_filter_string(&[("id", vdc_uuid(vdc_id))])),
        )
        .boxed()
        .try_next()
        .await
        .change_context(PolicyError::vcd("find org of VDC"))?
        .and_then(|r| r.org_name)
        .unwrap_or_default();

    let record = QueryRecord {
        href: vdc.href,
        name: vdc.name.unwrap_or_default(),
        org_name: Some(org_name),
        ..Default::default()
    };
    ovdc_info(manager, &record).await
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn vdc_ids_convert_both_ways() {
        assert_eq!(vdc_urn("abc"), "urn:vcloud:vdc:abc");
        assert_eq!(vdc_urn("urn:vcloud:vdc:abc"), "urn:vcloud:vdc:abc");
        assert_eq!(vdc_uuid("urn:vcloud:vdc:abc"), "abc");
        assert_eq!(vdc_uuid("abc"), "abc");
    }
}
