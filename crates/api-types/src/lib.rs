//! Shared API type definitions
//!
//! Wire types used across the CSE workspace: the vCD `cloudapi` and legacy
//! JSON documents the client reads and writes, and the request/response
//! envelopes CSE exchanges with vCD over the extension bus.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// cloudapi style reference (`{"id": ..., "name": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Legacy API style reference (`{"href": ..., "id": ..., "name": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reference {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// One page of a cloudapi collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default)]
    pub result_total: u64,
    #[serde(default)]
    pub page_count: u64,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default = "Vec::new")]
    pub values: Vec<T>,
}

/// One page of a legacy `/api/query` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecords<T> {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default = "Vec::new")]
    pub record: Vec<T>,
}

/// VDC compute policy as exposed by `cloudapi/*/vdcComputePolicies`.
///
/// A policy with a `pvdc_compute_policy` reference is a placement policy,
/// one with `is_sizing_only` set is a pure sizing policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdcComputePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_sizing_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvdc_compute_policy: Option<EntityReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Provider VDC compute policy (`cloudapi/2.0.0/pvdcComputePolicies`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvdcComputePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_sizing_only: bool,
}

/// Compute policy references attached to an org VDC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdcComputePolicyReferences {
    #[serde(default)]
    pub vdc_compute_policy_reference: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_vdc_compute_policy: Option<Reference>,
}

/// Compute policies of a single VM (`{vm}/computePolicy`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmComputePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_placement_policy: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_sizing_policy: Option<Reference>,
}

/// Record of a legacy typed query (`/api/query?type=...&format=records`).
///
/// Only the fields CSE reads are modelled; the rest are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdc_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, rename = "isVAppTemplate")]
    pub is_vapp_template: bool,
}

impl QueryRecord {
    /// Trailing uuid of the record href.
    pub fn uuid(&self) -> &str {
        self.href.rsplit('/').next().unwrap_or_default()
    }
}

/// Typed metadata value (`{"_type": "MetadataStringValue", "value": ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "_type")]
    pub kind: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub key: String,
    pub typed_value: TypedValue,
}

impl MetadataEntry {
    /// String metadata entry.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            typed_value: TypedValue {
                kind: "MetadataStringValue".to_string(),
                value: serde_json::Value::String(value.into()),
            },
        }
    }

    /// Value rendered as a string regardless of its metadata type.
    pub fn value_string(&self) -> String {
        match &self.typed_value.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Metadata of a legacy API object (`{href}/metadata`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub metadata_entry: Vec<MetadataEntry>,
}

/// Children of a vApp or vApp template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VAppChildren {
    #[serde(default)]
    pub vm: Vec<Reference>,
}

/// vApp or vApp template, reduced to what CSE navigates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VApp {
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<VAppChildren>,
}

impl VApp {
    pub fn vms(&self) -> &[Reference] {
        self.children
            .as_ref()
            .map(|c| c.vm.as_slice())
            .unwrap_or_default()
    }
}

/// Runtime defined entity instance (`cloudapi/1.0.0/entities`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinedEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub entity_type: String,
    pub entity: serde_json::Value,
    /// Href of the backing object, the cluster vApp for CSE clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<EntityReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<EntityReference>,
}

/// Status of a vCD task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Queued,
    PreRunning,
    Running,
    Success,
    Error,
    Canceled,
    Aborted,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Canceled | TaskStatus::Aborted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::PreRunning => "preRunning",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Error attached to a failed vCD task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_error_code: Option<u16>,
}

/// vCD task resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub href: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Request forwarded by vCD to the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: String,
    pub method: String,
    pub request_uri: String,
    #[serde(default)]
    pub query_string: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Response returned by the extension to vCD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

/// Body of an error response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub minor_error_code: String,
    /// HTTP reason phrase of the status code.
    pub reason: String,
    pub description: String,
    /// Contexts and printable attachments of the failure, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,
}

/// Paginated list returned by CSE list operations, mirroring vCD's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    pub result_total: u64,
    pub page_count: u64,
    pub page: u64,
    pub page_size: u64,
    pub values: Vec<T>,
}

/// Body of `PUT /ovdc/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OvdcUpdateRequest {
    /// Desired set of kubernetes runtimes (placement policy display names).
    #[serde(default)]
    pub k8s_runtime: Vec<String>,
    /// Reset VMs still using a removed policy before detaching it.
    #[serde(default)]
    pub remove_cp_from_vms_on_disable: bool,
}

/// Action of `PUT /ovdc/{id}/compute-policies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputePolicyAction {
    Add,
    Remove,
}

/// Body of `PUT /ovdc/{id}/compute-policies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvdcComputePolicyUpdate {
    pub action: ComputePolicyAction,
    pub compute_policy_name: String,
    #[serde(default)]
    pub remove_compute_policy_from_vms: bool,
}

/// Body of `PUT /system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUpdateRequest {
    pub server_action: ServerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAction {
    Enable,
    Disable,
}

/// Acknowledgement for operations that continue in the background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_href: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_without_values_deserializes_empty() {
        let page: Page<VdcComputePolicy> =
            serde_json::from_str(r#"{"resultTotal": 0, "page": 3}"#).expect("valid page");
        assert!(page.values.is_empty());
        assert_eq!(page.page, 3);
    }

    #[test]
    fn task_status_uses_vcd_spelling() {
        let task: Task = serde_json::from_str(
            r#"{"href": "https://vcd/api/task/1", "status": "preRunning"}"#,
        )
        .expect("valid task");
        assert_eq!(task.status, TaskStatus::PreRunning);
        assert!(!task.status.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
        assert_eq!(TaskStatus::Success.to_string(), "success");
    }

    #[test]
    fn placement_policy_carries_pvdc_reference() {
        let json = r#"{
            "id": "urn:vcloud:vdcComputePolicy:1",
            "name": "cse----native",
            "isSizingOnly": false,
            "pvdcComputePolicy": {"id": "urn:vcloud:pvdcComputePolicy:9", "name": "cse----native"}
        }"#;
        let policy: VdcComputePolicy = serde_json::from_str(json).expect("valid policy");
        assert!(policy.pvdc_compute_policy.is_some());
        assert!(!policy.is_sizing_only);
    }

    #[test]
    fn metadata_entries_render_values_as_strings() {
        let json = r#"{"metadataEntry": [
            {"key": "revision", "typedValue": {"_type": "MetadataNumberValue", "value": 2}},
            {"key": "os", "typedValue": {"_type": "MetadataStringValue", "value": "ubuntu-20.04"}}
        ]}"#;
        let metadata: Metadata = serde_json::from_str(json).expect("valid metadata");
        let values: Vec<String> = metadata
            .metadata_entry
            .iter()
            .map(MetadataEntry::value_string)
            .collect();
        assert_eq!(values, vec!["2".to_string(), "ubuntu-20.04".to_string()]);
    }

    #[test]
    fn query_record_uuid_is_trailing_segment() {
        let record = QueryRecord {
            href: "https://vcd/api/vdc/1234-abcd".to_string(),
            ..Default::default()
        };
        assert_eq!(record.uuid(), "1234-abcd");
    }

    #[test]
    fn ovdc_update_defaults() {
        let req: OvdcUpdateRequest =
            serde_json::from_str(r#"{"k8s_runtime": ["native"]}"#).expect("valid request");
        assert_eq!(req.k8s_runtime, vec!["native".to_string()]);
        assert!(!req.remove_cp_from_vms_on_disable);
    }
}
