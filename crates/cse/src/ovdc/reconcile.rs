//! Placement policy reconciliation of an org VDC.
//!
//! The desired runtimes are diffed against the placement policies already
//! assigned to the VDC; missing ones are attached and extra ones removed.
//! Progress is reported through a vCD task whose href is handed back
//! before the work starts.

use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::enabled_runtimes;
use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::CsePolicyName;
use crate::compute_policy::PolicyError;
use crate::compute_policy::PolicyResult;
use crate::context::OperationContext;
use crate::progress::ProgressTask;
use crate::tasks::TaskRunner;
use crate::util::keyed_lock::KeyedAsyncLock;

/// Runtimes to attach and detach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementDiff {
    pub to_add: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl PlacementDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

pub fn compute_diff(existing: &BTreeSet<String>, desired: &BTreeSet<String>) -> PlacementDiff {
    PlacementDiff {
        to_add: desired.difference(existing).cloned().collect(),
        to_delete: existing.difference(desired).cloned().collect(),
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub vdc_id: String,
    /// Placement policy display names.
    pub desired: BTreeSet<String>,
    /// Reset VMs still using a removed policy before detaching it.
    pub remove_cp_from_vms: bool,
}

/// Creates the progress task, queues the reconciliation and returns the
/// task href. The context is ended once the background job finishes.
pub async fn start_reconciliation(
    ctx: OperationContext,
    runner: &TaskRunner,
    locks: Arc<KeyedAsyncLock<String>>,
    request: ReconcileRequest,
) -> PolicyResult<String> {
    let client = ctx.sysadmin_client().clone();
    let task = match ProgressTask::start(
        client.clone(),
        &format!("Updating kubernetes runtimes of org VDC {}", request.vdc_id),
        "ovdc update",
        None,
    )
    .await
    {
        Ok(task) => task,
        Err(e) => {
            ctx.end().await;
            return Err(e.change_context(PolicyError::vcd("create task")));
        }
    };
    let href = task.href().to_string();

    let job_name = format!("ovdc-update-{}", request.vdc_id);
    runner.spawn(&job_name, move |token| async move {
        let result = match check_cancelled(&token) {
            Ok(()) => {
                let _guard = locks.lock(&request.vdc_id).await;
                match ComputePolicyManager::new(client).await {
                    Ok(manager) => reconcile(&manager, &request, &task, &token).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(diff) => {
                info!(
                    vdc_id = %request.vdc_id,
                    added = ?diff.to_add,
                    removed = ?diff.to_delete,
                    "Org VDC placement policies reconciled"
                );
                task.success(&format!(
                    "Updated kubernetes runtimes of org VDC {}",
                    request.vdc_id
                ))
                .await;
            }
            Err(e) => {
                error!(vdc_id = %request.vdc_id, "Org VDC update failed: {e:?}");
                task.error(&e.to_string()).await;
            }
        }
        ctx.end().await;
    });

    Ok(href)
}

/// Applies the diff between existing and desired placement policies.
/// The task is only updated with progress; the caller finishes it.
pub async fn reconcile(
    manager: &ComputePolicyManager,
    request: &ReconcileRequest,
    task: &ProgressTask,
    token: &CancellationToken,
) -> PolicyResult<PlacementDiff> {
    let existing: BTreeSet<String> = enabled_runtimes(manager, &request.vdc_id)
        .await?
        .into_iter()
        .collect();
    let diff = compute_diff(&existing, &request.desired);
    if diff.is_empty() {
        return Ok(diff);
    }

    for name in &diff.to_add {
        check_cancelled(token)?;
        task.running(&format!("Adding placement policy {name}")).await;
        let policy = resolve(manager, name).await?;
        let href = policy_href(manager, &policy)?;
        manager
            .add_compute_policy_to_vdc(&request.vdc_id, &href)
            .await?;
    }

    for name in &diff.to_delete {
        check_cancelled(token)?;
        task.running(&format!("Removing placement policy {name}")).await;
        let policy = resolve(manager, name).await?;
        let href = policy_href(manager, &policy)?;
        manager
            .remove_compute_policy_from_vdc_sync(
                &request.vdc_id,
                &href,
                request.remove_cp_from_vms,
                true,
                Some(task),
            )
            .await?;
    }

    Ok(diff)
}

async fn resolve(
    manager: &ComputePolicyManager,
    display_name: &str,
) -> PolicyResult<api_types::VdcComputePolicy> {
    let name = CsePolicyName::new(display_name)?;
    manager.get_vdc_compute_policy(&name, true).await
}

fn policy_href(
    manager: &ComputePolicyManager,
    policy: &api_types::VdcComputePolicy,
) -> PolicyResult<String> {
    let id = policy.id.as_deref().ok_or_else(|| {
        Report::new(PolicyError::vcd(format!("policy {} has no id", policy.name)))
    })?;
    let config = manager.client().config();
    Ok(manager
        .client()
        .cloudapi_url(config.compute_policy_api_path(), &format!("vdcComputePolicies/{id}")))
}

fn check_cancelled(token: &CancellationToken) -> PolicyResult<()> {
    if token.is_cancelled() {
        return Err(
            Report::new(PolicyError::vcd("reconciliation cancelled by shutdown"))
                .attach_printable("CSE server is shutting down"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;
    use vcd_client::ClientConfig;
    use vcd_client::VcdClient;
    use wiremock::matchers::body_partial_json;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::matchers::query_param;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_adds_missing_runtime() {
        let diff = compute_diff(&set(&["native"]), &set(&["native", "tkg"]));
        assert_eq!(diff.to_add, set(&["tkg"]));
        assert_eq!(diff.to_delete, set(&[]));
    }

    #[test]
    fn diff_removes_extra_runtime() {
        let diff = compute_diff(&set(&["native", "tkgm"]), &set(&["native"]));
        assert_eq!(diff.to_add, set(&[]));
        assert_eq!(diff.to_delete, set(&["tkgm"]));
    }

    #[test]
    fn same_sets_converge_to_no_op() {
        let desired = set(&["native", "tkg"]);
        assert!(compute_diff(&desired, &desired).is_empty());
        assert!(compute_diff(&set(&[]), &set(&[])).is_empty());
    }

    #[test(tokio::test)]
    async fn reconcile_attaches_missing_policy() {
        let server = MockServer::start().await;
        let uri = server.uri();

        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcComputePolicies"))
            .and(query_param("pageSize", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        // existing: native
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcs/urn:vcloud:vdc:v1/computePolicies"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": [
                {"id": "urn:vcloud:vdcComputePolicy:n", "name": "cse----native", "pvdcComputePolicy": {"id": "p1"}}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcs/urn:vcloud:vdc:v1/computePolicies"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        // lookup of tkg
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcComputePolicies"))
            .and(query_param("page", "1"))
            .and(query_param("pageSize", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": [
                {"id": "urn:vcloud:vdcComputePolicy:t", "name": "cse----tkg", "pvdcComputePolicy": {"id": "p2"}}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/admin/vdc/v1/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/admin/vdc/v1/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [{"href": "x"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/task/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;

        let client = VcdClient::new(ClientConfig::new(uri))
            .expect("client")
            .with_token("t");
        let manager = ComputePolicyManager::new(client.clone())
            .await
            .expect("manager");
        let task = ProgressTask::start(client, "update", "ovdc update", None)
            .await
            .expect("task");
        let request = ReconcileRequest {
            vdc_id: "v1".to_string(),
            desired: set(&["native", "tkg"]),
            remove_cp_from_vms: false,
        };

        let diff = reconcile(&manager, &request, &task, &CancellationToken::new())
            .await
            .expect("reconciled");
        assert_eq!(diff.to_add, set(&["tkg"]));
        assert!(diff.to_delete.is_empty());
    }

    #[test(tokio::test)]
    async fn cancelled_token_stops_before_changes() {
        let token = CancellationToken::new();
        token.cancel();
        let err = check_cancelled(&token).expect_err("cancelled");
        assert!(matches!(err.current_context(), PolicyError::Vcd { .. }));
    }

    #[test(tokio::test)]
    async fn queued_reconciliation_is_finished_on_shutdown() {
        let server = MockServer::start().await;
        let uri = server.uri();

        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/task/1"))
            .and(body_partial_json(json!({"status": "error"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "error"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/cloudapi/1.0.0/sessions/current"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let runner = TaskRunner::new(1);
        runner.spawn("busy", |token| async move { token.cancelled().await });

        let client = VcdClient::new(ClientConfig::new(uri.clone()))
            .expect("client")
            .with_token("t");
        let request = ReconcileRequest {
            vdc_id: "v1".to_string(),
            desired: set(&["tkg"]),
            remove_cp_from_vms: false,
        };
        let href = start_reconciliation(
            OperationContext::new(client, None),
            &runner,
            Arc::new(KeyedAsyncLock::new()),
            request,
        )
        .await
        .expect("started");
        assert_eq!(href, format!("{uri}/api/task/1"));

        runner.shutdown(Duration::from_secs(5)).await;
        assert_eq!(runner.active(), 0);
        server.verify().await;
    }

    #[test(tokio::test)]
    async fn reconcile_detaches_extra_policy_and_clears_vms() {
        let server = MockServer::start().await;
        let uri = server.uri();
        let tkgm = "urn:vcloud:vdcComputePolicy:k";

        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcComputePolicies"))
            .and(query_param("pageSize", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcs/urn:vcloud:vdc:v1/computePolicies"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": [
                {"id": "urn:vcloud:vdcComputePolicy:n", "name": "cse----native", "pvdcComputePolicy": {"id": "p1"}},
                {"id": tkgm, "name": "cse----tkgm", "pvdcComputePolicy": {"id": "p3"}}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcs/urn:vcloud:vdc:v1/computePolicies"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcComputePolicies"))
            .and(query_param("page", "1"))
            .and(query_param("pageSize", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": [
                {"id": tkgm, "name": "cse----tkgm", "pvdcComputePolicy": {"id": "p3"}}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/2.0.0/vdcComputePolicies"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("type", "adminVM"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 1, "page": 1, "pageSize": 25,
                "record": [{"href": format!("{uri}/api/vApp/vm-1"), "name": "worker"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vApp/vm-1/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vmPlacementPolicy": {"id": tkgm, "href": format!("{uri}/cloudapi/2.0.0/vdcComputePolicies/{tkgm}")}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/vApp/vm-1/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/admin/vdc/v1/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [
                    {"href": format!("{uri}/cloudapi/2.0.0/vdcComputePolicies/urn:vcloud:vdcComputePolicy:n")},
                    {"href": format!("{uri}/cloudapi/2.0.0/vdcComputePolicies/{tkgm}")}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/admin/vdc/v1/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/task/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;

        let client = VcdClient::new(ClientConfig::new(uri))
            .expect("client")
            .with_token("t");
        let manager = ComputePolicyManager::new(client.clone())
            .await
            .expect("manager");
        let task = ProgressTask::start(client, "update", "ovdc update", None)
            .await
            .expect("task");
        let request = ReconcileRequest {
            vdc_id: "v1".to_string(),
            desired: set(&["native"]),
            remove_cp_from_vms: true,
        };

        let diff = reconcile(&manager, &request, &task, &CancellationToken::new())
            .await
            .expect("reconciled");
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_delete, set(&["tkgm"]));

        let requests = server.received_requests().await.expect("recording enabled");
        let vm_update = requests
            .iter()
            .find(|r| r.method.to_string() == "PUT" && r.url.path() == "/api/vApp/vm-1/computePolicy")
            .expect("vm updated");
        let body: serde_json::Value = serde_json::from_slice(&vm_update.body).expect("json body");
        assert!(body.get("vmPlacementPolicy").is_none());
        let detached = requests
            .iter()
            .find(|r| r.method.to_string() == "PUT" && r.url.path() == "/api/admin/vdc/v1/computePolicies")
            .expect("vdc updated");
        let body = String::from_utf8_lossy(&detached.body);
        assert!(!body.contains(tkgm));
        assert!(body.contains("urn:vcloud:vdcComputePolicy:n"));
    }
}

