//! Request dispatch: envelope in, envelope out.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::ComputePolicyAction;
use api_types::OvdcComputePolicyUpdate;
use api_types::OvdcUpdateRequest;
use api_types::RequestEnvelope;
use api_types::ResponseEnvelope;
use api_types::ServerAction;
use api_types::SystemUpdateRequest;
use api_types::TaskAccepted;
use api_types::VdcComputePolicy;
use error_stack::Report;
use error_stack::ResultExt;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::version::CSE_VERSION;

use super::clusters;
use super::errors::error_envelope;
use super::errors::from_policy_error;
use super::errors::from_vcd_status;
use super::errors::RequestError;
use super::errors::RequestResult;
use super::router::route;
use super::router::Operation;
use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::CsePolicyName;
use crate::compute_policy::K8sRuntime;
use crate::compute_policy::PolicyError;
use crate::context::ContextFactory;
use crate::context::OperationContext;
use crate::install::extension::ExtensionManager;
use crate::ovdc;
use crate::ovdc::reconcile::start_reconciliation;
use crate::ovdc::reconcile::ReconcileRequest;
use crate::progress::ProgressTask;
use crate::server_config::ServerConfig;
use crate::server_config::TEMPLATES_PATH;
use crate::tasks::TaskRunner;
use crate::telemetry::CseOperation;
use crate::telemetry::OperationStatus;
use crate::telemetry::TelemetryClient;
use crate::util::keyed_lock::KeyedAsyncLock;

pub const DEFAULT_PAGE_SIZE: u64 = 25;
pub const MAX_PAGE_SIZE: u64 = 128;

/// Everything a request handler may touch, built once at startup.
pub struct ServerState {
    pub contexts: ContextFactory,
    pub server_config: Arc<ServerConfig>,
    pub runner: Arc<TaskRunner>,
    pub locks: Arc<KeyedAsyncLock<String>>,
    pub telemetry: TelemetryClient,
    pub legacy_mode: bool,
    /// Refuse requests vCD forwarded without the caller's token.
    pub enforce_authorization: bool,
}

/// Status and JSON body of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn ok(body: impl Serialize) -> RequestResult<Self> {
        Self::with_status(200, body)
    }

    fn accepted(task_href: String) -> RequestResult<Self> {
        Self::with_status(202, TaskAccepted { task_href })
    }

    fn with_status(status: u16, body: impl Serialize) -> RequestResult<Self> {
        let body = serde_json::to_value(body)
            .change_context(RequestError::internal("failed to serialize response"))?;
        Ok(Self { status, body })
    }
}

/// `page` and `pageSize` of a query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: u64,
    pub page_size: u64,
}

impl Paging {
    pub fn parse(query_string: &str) -> RequestResult<Self> {
        let params: BTreeMap<String, String> = url::form_urlencoded::parse(query_string.as_bytes())
            .into_owned()
            .collect();
        let number = |key: &str, default: u64| -> RequestResult<u64> {
            match params.get(key) {
                None => Ok(default),
                Some(v) => v
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Report::new(RequestError::bad_request(format!("invalid {key} '{v}'")))),
            }
        };
        Ok(Self {
            page: number("page", 1)?,
            page_size: number("pageSize", DEFAULT_PAGE_SIZE)?.min(MAX_PAGE_SIZE),
        })
    }
}

/// Caller's vCD token, from either header vCD forwards it in.
fn user_token(headers: &BTreeMap<String, String>) -> Option<String> {
    headers.iter().find_map(|(name, value)| {
        let name = name.to_ascii_lowercase();
        if name == "x-vcloud-authorization" {
            Some(value.clone())
        } else if name == "authorization" {
            value.strip_prefix("Bearer ").map(str::to_string)
        } else {
            None
        }
    })
}

fn parse_body<T: DeserializeOwned>(body: &Value) -> RequestResult<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| Report::new(RequestError::bad_request(format!("malformed request body: {e}"))))
}

fn telemetry_operation(operation: &Operation) -> Option<CseOperation> {
    match operation {
        Operation::SystemUpdate => Some(CseOperation::SystemUpdate),
        Operation::TemplateList => Some(CseOperation::TemplateList),
        Operation::OvdcList => Some(CseOperation::OvdcList),
        Operation::OvdcInfo { .. } => Some(CseOperation::OvdcInfo),
        Operation::OvdcUpdate { .. } => Some(CseOperation::OvdcUpdate),
        Operation::OvdcComputePolicyUpdate { .. } => Some(CseOperation::OvdcComputePolicyUpdate),
        Operation::ClusterList => Some(CseOperation::ClusterList),
        Operation::ClusterInfo { .. } => Some(CseOperation::ClusterInfo),
        Operation::ClusterDelete { .. } => Some(CseOperation::ClusterDelete),
        Operation::ClusterConfig { .. } => Some(CseOperation::ClusterConfig),
        _ => None,
    }
}

/// Handles one request envelope. Never fails: errors become error
/// envelopes.
pub async fn dispatch(state: &ServerState, request: RequestEnvelope) -> ResponseEnvelope {
    let (operation, result) = match route(&request.method, &request.request_uri) {
        Ok(operation) => {
            let result = handle(state, operation.clone(), &request).await;
            (Some(operation), result)
        }
        Err(e) => (None, Err(e)),
    };

    if let Some(op) = operation.as_ref().and_then(telemetry_operation) {
        let status = if result.is_ok() {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        };
        state.telemetry.record(op, status).await;
    }

    match result {
        Ok(reply) => ResponseEnvelope {
            id: request.id,
            status_code: reply.status,
            headers: BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: reply.body,
        },
        Err(report) => {
            if report.current_context().status_code() >= 500 {
                error!(uri = %request.request_uri, "Request failed: {report:?}");
            } else {
                warn!(uri = %request.request_uri, "Request rejected: {}", report.current_context());
            }
            error_envelope(&request.id, &report)
        }
    }
}

async fn handle(state: &ServerState, operation: Operation, request: &RequestEnvelope) -> RequestResult<Reply> {
    if !operation.allowed_when_disabled() && !state.server_config.is_enabled() {
        return Err(Report::new(RequestError::Unavailable));
    }
    info!(operation = operation.name(), uri = %request.request_uri, "Handling request");

    match &operation {
        Operation::SystemInfo => return system_info(state),
        Operation::TemplateList => {
            let templates = state.server_config.get_value_at(TEMPLATES_PATH);
            return Reply::ok(templates.unwrap_or(json!([])));
        }
        Operation::ClusterCreate
        | Operation::ClusterResize { .. }
        | Operation::NodeCreate
        | Operation::NodeInfo { .. }
        | Operation::NodeDelete => {
            return Err(Report::new(RequestError::NotImplemented {
                operation: operation.name().to_string(),
            }))
        }
        _ => {}
    }

    let token = user_token(&request.headers);
    if state.enforce_authorization && token.is_none() {
        return Err(Report::new(RequestError::Forbidden {
            message: "the request carries no vCD session".to_string(),
        }));
    }
    let paging = Paging::parse(&request.query_string)?;
    let ctx = state
        .contexts
        .open(token.as_deref())
        .await
        .map_err(|e| from_vcd_status(e, "vCD session", RequestError::internal("failed to open a vCD session")))?;

    // These hand the context to background work, which ends it.
    match operation {
        Operation::OvdcUpdate { ovdc_id } => return ovdc_update(state, ctx, ovdc_id, &request.body).await,
        Operation::OvdcComputePolicyUpdate { ovdc_id } => {
            return compute_policy_update(state, ctx, ovdc_id, &request.body).await
        }
        Operation::ClusterDelete { cluster_id } => return cluster_delete(state, ctx, &cluster_id).await,
        operation => {
            let result = handle_in_context(state, &ctx, operation, paging, &request.body).await;
            ctx.end().await;
            result
        }
    }
}

async fn handle_in_context(
    state: &ServerState,
    ctx: &OperationContext,
    operation: Operation,
    paging: Paging,
    body: &Value,
) -> RequestResult<Reply> {
    match operation {
        Operation::SystemUpdate => system_update(state, ctx, body).await,
        Operation::OvdcList => {
            let manager = policy_manager(ctx).await?;
            let page = ovdc::list_ovdcs(&manager, paging.page, paging.page_size)
                .await
                .map_err(from_policy_error)?;
            Reply::ok(page)
        }
        Operation::OvdcInfo { ovdc_id } => {
            let manager = policy_manager(ctx).await?;
            Reply::ok(ovdc::get_ovdc(&manager, &ovdc_id).await.map_err(from_policy_error)?)
        }
        Operation::OvdcComputePolicyList { ovdc_id } => compute_policy_list(ctx, &ovdc_id).await,
        Operation::ClusterList => {
            let page = clusters::list_clusters(ctx.client(), paging.page, paging.page_size)
                .await
                .map_err(|e| from_vcd_status(e, "Clusters", RequestError::internal("failed to list clusters")))?;
            Reply::ok(page)
        }
        Operation::ClusterInfo { cluster_id } => Reply::ok(cluster_entity(ctx, &cluster_id).await?),
        Operation::ClusterConfig { cluster_id } => {
            let entity = cluster_entity(ctx, &cluster_id).await?;
            let config = clusters::kubeconfig(&entity).ok_or_else(|| {
                Report::new(RequestError::NotFound {
                    resource: format!("Kubeconfig of cluster {}", entity.name),
                })
            })?;
            Reply::ok(config)
        }
        other => Err(Report::new(RequestError::internal(format!(
            "{} has no in-context handler",
            other.name()
        )))),
    }
}

async fn policy_manager(ctx: &OperationContext) -> RequestResult<ComputePolicyManager> {
    ComputePolicyManager::new(ctx.sysadmin_client().clone())
        .await
        .map_err(from_policy_error)
}

async fn cluster_entity(ctx: &OperationContext, cluster_id: &str) -> RequestResult<api_types::DefinedEntity> {
    clusters::get_cluster(ctx.client(), cluster_id)
        .await
        .map_err(|e| from_vcd_status(e, &format!("Cluster {cluster_id}"), RequestError::internal("failed to read cluster")))
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    product: &'static str,
    version: &'static str,
    enabled: bool,
    legacy_mode: bool,
    active_background_jobs: usize,
}

fn system_info(state: &ServerState) -> RequestResult<Reply> {
    Reply::ok(SystemInfo {
        product: "CSE",
        version: CSE_VERSION,
        enabled: state.server_config.is_enabled(),
        legacy_mode: state.legacy_mode,
        active_background_jobs: state.runner.active(),
    })
}

async fn system_update(state: &ServerState, ctx: &OperationContext, body: &Value) -> RequestResult<Reply> {
    let update: SystemUpdateRequest = parse_body(body)?;
    let enabled = update.server_action == ServerAction::Enable;
    let extensions = ExtensionManager::new(ctx.sysadmin_client().clone());
    let failed = |e| from_vcd_status(e, "CSE extension", RequestError::internal("failed to toggle the CSE extension"));
    let kind = extensions.detect_kind().await.map_err(failed)?;
    extensions.set_enabled(kind, enabled).await.map_err(failed)?;
    state.server_config.set_enabled(enabled);
    let message = if enabled { "CSE enabled" } else { "CSE disabled" };
    info!("{message}");
    Reply::ok(json!({ "message": message }))
}

async fn ovdc_update(state: &ServerState, ctx: OperationContext, ovdc_id: String, body: &Value) -> RequestResult<Reply> {
    let desired = match desired_runtimes(state, body) {
        Ok(desired) => desired,
        Err(e) => {
            ctx.end().await;
            return Err(e);
        }
    };
    let request = ReconcileRequest {
        vdc_id: ovdc_id,
        desired: desired.0,
        remove_cp_from_vms: desired.1,
    };
    let href = start_reconciliation(ctx, &state.runner, Arc::clone(&state.locks), request)
        .await
        .map_err(from_policy_error)?;
    Reply::accepted(href)
}

/// Placement policy display names requested by an OVDC update, and
/// whether VMs should be reset.
fn desired_runtimes(state: &ServerState, body: &Value) -> RequestResult<(BTreeSet<String>, bool)> {
    if state.legacy_mode {
        return Err(Report::new(RequestError::bad_request(
            "kubernetes runtime placement is not available in legacy mode",
        )));
    }
    let update: OvdcUpdateRequest = parse_body(body)?;
    let mut desired = BTreeSet::new();
    for runtime in &update.k8s_runtime {
        let runtime: K8sRuntime = runtime.parse().map_err(from_policy_error)?;
        desired.insert(runtime.policy_display_name().to_string());
    }
    Ok((desired, update.remove_cp_from_vms_on_disable))
}

#[derive(Debug, Serialize)]
struct PolicyView {
    name: String,
    id: String,
    href: String,
    description: Option<String>,
    is_placement: bool,
}

async fn compute_policy_list(ctx: &OperationContext, ovdc_id: &str) -> RequestResult<Reply> {
    let manager = policy_manager(ctx).await?;
    let policies: Vec<VdcComputePolicy> = manager
        .list_vdc_compute_policies(ovdc_id)
        .try_collect()
        .await
        .map_err(from_policy_error)?;
    let views: Vec<PolicyView> = policies
        .into_iter()
        .filter_map(|p| {
            let name = CsePolicyName::from_stored(&p.name)?;
            let id = p.id.unwrap_or_default();
            Some(PolicyView {
                name: name.display_name().to_string(),
                href: manager.policy_href(&id),
                id,
                description: p.description,
                is_placement: p.pvdc_compute_policy.is_some(),
            })
        })
        .collect();
    Reply::ok(views)
}

async fn compute_policy_update(
    state: &ServerState,
    ctx: OperationContext,
    ovdc_id: String,
    body: &Value,
) -> RequestResult<Reply> {
    let prepared = async {
        let update: OvdcComputePolicyUpdate = parse_body(body)?;
        let name = CsePolicyName::new(update.compute_policy_name.clone()).map_err(from_policy_error)?;
        let manager = policy_manager(&ctx).await?;
        let policy = manager
            .get_vdc_compute_policy(&name, false)
            .await
            .map_err(from_policy_error)?;
        let href = manager.policy_href(policy.id.as_deref().unwrap_or_default());
        Ok::<_, Report<RequestError>>((update, name, manager, href))
    }
    .await;
    let (update, name, manager, href) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            ctx.end().await;
            return Err(e);
        }
    };

    match update.action {
        ComputePolicyAction::Add => {
            let result = manager.add_compute_policy_to_vdc(&ovdc_id, &href).await;
            ctx.end().await;
            result.map_err(from_policy_error)?;
            Reply::ok(json!({
                "message": format!("Added compute policy '{name}' to org VDC {ovdc_id}")
            }))
        }
        ComputePolicyAction::Remove => {
            let task = match ProgressTask::start(
                ctx.sysadmin_client().clone(),
                &format!("Removing compute policy '{name}' from org VDC {ovdc_id}"),
                "remove compute policy",
                None,
            )
            .await
            {
                Ok(task) => task,
                Err(e) => {
                    ctx.end().await;
                    return Err(from_vcd_status(e, "Task", RequestError::internal("failed to create task")));
                }
            };
            let task_href = task.href().to_string();
            let force = update.remove_compute_policy_from_vms;
            state
                .runner
                .spawn(&format!("remove-policy-{ovdc_id}"), move |token| async move {
                    let result = if token.is_cancelled() {
                        Err(Report::new(PolicyError::vcd("CSE is shutting down")))
                    } else {
                        manager
                            .remove_compute_policy_from_vdc_sync(&ovdc_id, &href, force, false, Some(&task))
                            .await
                    };
                    match result {
                        Ok(()) => {
                            task.success(&format!("Removed compute policy '{name}' from org VDC {ovdc_id}"))
                                .await
                        }
                        Err(e) => {
                            error!(%ovdc_id, policy = %name, "Compute policy removal failed: {e:?}");
                            task.error(&e.to_string()).await;
                        }
                    }
                    ctx.end().await;
                });
            Reply::accepted(task_href)
        }
    }
}

async fn cluster_delete(state: &ServerState, ctx: OperationContext, cluster_id: &str) -> RequestResult<Reply> {
    let entity = match cluster_entity(&ctx, cluster_id).await {
        Ok(entity) => entity,
        Err(e) => {
            ctx.end().await;
            return Err(e);
        }
    };
    let task = match ProgressTask::start(
        ctx.sysadmin_client().clone(),
        &format!("Deleting cluster {}", entity.name),
        "delete cluster",
        None,
    )
    .await
    {
        Ok(task) => task,
        Err(e) => {
            ctx.end().await;
            return Err(from_vcd_status(e, "Task", RequestError::internal("failed to create task")));
        }
    };
    let task_href = task.href().to_string();
    state
        .runner
        .spawn(&format!("delete-cluster-{}", entity.name), move |token| async move {
            if token.is_cancelled() {
                task.error("CSE is shutting down").await;
            } else {
                match clusters::delete_cluster(ctx.sysadmin_client(), &entity, &task).await {
                    Ok(()) => task.success(&format!("Deleted cluster {}", entity.name)).await,
                    Err(e) => {
                        error!(cluster = %entity.name, "Cluster deletion failed: {e:?}");
                        task.error(&e.to_string()).await;
                    }
                }
            }
            ctx.end().await;
        });
    Reply::accepted(task_href)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;
    use vcd_client::ClientConfig;
    use vcd_client::Credentials;

    use super::*;

    fn state(enabled: bool) -> ServerState {
        let server_config = ServerConfig::new(json!({
            "service": {"enabled": enabled},
            "broker": {"templates": [{"name": "photon-v2", "revision": 1}]},
        }));
        ServerState {
            contexts: ContextFactory::new(
                ClientConfig::new("http://127.0.0.1:9"),
                Credentials::system("administrator", "pw"),
            ),
            server_config: Arc::new(server_config),
            runner: Arc::new(TaskRunner::new(2)),
            locks: Arc::new(KeyedAsyncLock::new()),
            telemetry: TelemetryClient::disabled(),
            legacy_mode: false,
            enforce_authorization: true,
        }
    }

    fn request(method: &str, uri: &str) -> RequestEnvelope {
        RequestEnvelope {
            id: "r1".into(),
            method: method.into(),
            request_uri: uri.into(),
            ..Default::default()
        }
    }

    #[test]
    fn paging_defaults_and_limits() {
        assert_eq!(
            Paging::parse("").expect("empty"),
            Paging {
                page: 1,
                page_size: DEFAULT_PAGE_SIZE
            }
        );
        assert_eq!(
            Paging::parse("page=3&pageSize=500").expect("parse"),
            Paging {
                page: 3,
                page_size: MAX_PAGE_SIZE
            }
        );
        assert!(Paging::parse("page=0").is_err());
        assert!(Paging::parse("pageSize=x").is_err());
    }

    #[test]
    fn token_is_read_from_either_header() {
        let headers = BTreeMap::from([("X-VCLOUD-AUTHORIZATION".to_string(), "abc".to_string())]);
        assert_eq!(user_token(&headers), Some("abc".to_string()));
        let headers = BTreeMap::from([("Authorization".to_string(), "Bearer xyz".to_string())]);
        assert_eq!(user_token(&headers), Some("xyz".to_string()));
        assert_eq!(user_token(&BTreeMap::new()), None);
    }

    #[test(tokio::test)]
    async fn templates_are_served_from_server_config() {
        let response = dispatch(&state(true), request("GET", "/api/cse/templates")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, json!([{"name": "photon-v2", "revision": 1}]));
    }

    #[test(tokio::test)]
    async fn disabled_service_only_answers_system_requests() {
        let state = state(false);
        let response = dispatch(&state, request("GET", "/api/cse/ovdcs")).await;
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body["minorErrorCode"], "SERVICE_UNAVAILABLE");

        let response = dispatch(&state, request("GET", "/api/cse/system")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["enabled"], false);
    }

    #[test(tokio::test)]
    async fn routing_errors_become_envelopes() {
        let state = state(true);
        assert_eq!(dispatch(&state, request("GET", "/api/cse/vms")).await.status_code, 404);
        assert_eq!(dispatch(&state, request("PATCH", "/api/cse/system")).await.status_code, 405);
        assert_eq!(dispatch(&state, request("POST", "/api/cse/clusters")).await.status_code, 501);
        for (method, uri) in [
            ("POST", "/api/cse/nodes"),
            ("DELETE", "/api/cse/nodes"),
            ("GET", "/api/cse/node/worker-1"),
        ] {
            let response = dispatch(&state, request(method, uri)).await;
            assert_eq!(response.status_code, 501, "{method} {uri}");
            assert_eq!(response.body["minorErrorCode"], "NOT_IMPLEMENTED");
        }
    }

    #[test(tokio::test)]
    async fn requests_without_session_are_refused() {
        let response = dispatch(&state(true), request("GET", "/api/cse/ovdcs")).await;
        assert_eq!(response.status_code, 403);
    }
}
