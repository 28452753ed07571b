//! Compute policy manager over vCD's cloudapi.

use api_types::EntityReference;
use api_types::PvdcComputePolicy;
use api_types::QueryRecord;
use api_types::Reference;
use api_types::VApp;
use api_types::VdcComputePolicy;
use api_types::VdcComputePolicyReferences;
use api_types::VmComputePolicy;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;

use super::error::PolicyError;
use super::error::PolicyResult;
use super::naming::CsePolicyName;
use crate::ovdc::vdc_urn;
use crate::ovdc::vdc_uuid;
use crate::progress::ProgressTask;

/// Name of the sizing policy vCD assigns when no other one applies.
pub const SYSTEM_DEFAULT_POLICY: &str = "System Default";

const MIN_PVDC_POLICY_API: f64 = 35.0;

/// A CSE-owned policy with its user-facing name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsePolicy {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub href: String,
    pub is_placement: bool,
}

impl CsePolicy {
    fn from_vdc_policy(policy: VdcComputePolicy, href: String) -> Option<Self> {
        let name = CsePolicyName::from_stored(&policy.name)?;
        Some(Self {
            id: policy.id.unwrap_or_default(),
            display_name: name.display_name().to_string(),
            name: policy.name,
            description: policy.description,
            href,
            is_placement: policy.pvdc_compute_policy.is_some(),
        })
    }
}

fn is_placement(policy: &VdcComputePolicy) -> bool {
    policy.pvdc_compute_policy.is_some()
}

/// CRUD over sizing and placement policies, their VDC assignment and
/// the tagging of template VMs.
#[derive(Debug, Clone)]
pub struct ComputePolicyManager {
    client: VcdClient,
    api_path: &'static str,
    api_version: f64,
}

impl ComputePolicyManager {
    /// Creates a manager after probing the policy endpoint with a one item
    /// listing.
    pub async fn new(client: VcdClient) -> PolicyResult<Self> {
        let config = client.config();
        let api_path = config.compute_policy_api_path();
        let api_version = config
            .api_version_number()
            .change_context(PolicyError::vcd("read API version"))?;
        let host = config.host.clone();

        let probe = format!(
            "{}?page=1&pageSize=1",
            client.cloudapi_url(api_path, "vdcComputePolicies")
        );
        if let Err(e) = client.send(reqwest::Method::GET, &probe, None).await {
            warn!(%host, "Compute policy endpoint probe failed: {e:?}");
            return Err(e.change_context(PolicyError::OperationNotSupported { host }));
        }

        Ok(Self {
            client,
            api_path,
            api_version,
        })
    }

    pub fn client(&self) -> &VcdClient {
        &self.client
    }

    /// Global PVDC policies (and therefore placement policies) need API 35.0.
    pub fn is_pvdc_policy_supported(&self) -> bool {
        self.api_version >= MIN_PVDC_POLICY_API
    }

    fn ensure_pvdc_supported(&self) -> PolicyResult<()> {
        if self.is_pvdc_policy_supported() {
            Ok(())
        } else {
            Err(Report::new(PolicyError::GlobalPvdcComputePolicyNotSupported {
                api_version: self.client.config().api_version.clone(),
            }))
        }
    }

    fn url(&self, path: &str) -> String {
        self.client.cloudapi_url(self.api_path, path)
    }

    /// Cloudapi href of a VDC compute policy.
    pub fn policy_href(&self, id: &str) -> String {
        self.url(&format!("vdcComputePolicies/{id}"))
    }

    fn listing_query(filters: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut query = Vec::new();
        let filter = construct_filter_string(filters);
        if !filter.is_empty() {
            query.push(("filter".to_string(), filter));
        }
        query.push(("sortAsc".to_string(), "name".to_string()));
        query
    }

    /// Every VDC compute policy matching `filters`, page by page.
    pub fn get_all_vdc_compute_policies<'a>(
        &'a self,
        filters: &[(&str, &str)],
    ) -> impl Stream<Item = PolicyResult<VdcComputePolicy>> + 'a {
        self.client
            .paginate::<VdcComputePolicy>(self.url("vdcComputePolicies"), Self::listing_query(filters))
            .map(|item| item.change_context(PolicyError::vcd("list VDC compute policies")))
    }

    /// Every provider VDC compute policy matching `filters`.
    pub fn get_all_pvdc_compute_policies<'a>(
        &'a self,
        filters: &[(&str, &str)],
    ) -> PolicyResult<impl Stream<Item = PolicyResult<PvdcComputePolicy>> + 'a> {
        self.ensure_pvdc_supported()?;
        Ok(self
            .client
            .paginate::<PvdcComputePolicy>(
                self.url("pvdcComputePolicies"),
                Self::listing_query(filters),
            )
            .map(|item| item.change_context(PolicyError::vcd("list PVDC compute policies"))))
    }

    /// Looks up a CSE-owned VDC policy of the given flavour.
    pub async fn get_vdc_compute_policy(
        &self,
        name: &CsePolicyName,
        is_placement_policy: bool,
    ) -> PolicyResult<VdcComputePolicy> {
        let stored = name.stored();
        let matches = |p: &VdcComputePolicy| p.name == stored && is_placement(p) == is_placement_policy;

        let found = self
            .get_all_vdc_compute_policies(&[("name", stored.as_str())])
            .try_filter(|p| futures::future::ready(matches(p)))
            .boxed()
            .try_next()
            .await?;

        found.ok_or_else(|| {
            Report::new(PolicyError::EntityNotFound {
                name: name.display_name().to_string(),
            })
        })
    }

    /// Looks up a vCD policy by its exact (unprefixed) name, e.g.
    /// [`SYSTEM_DEFAULT_POLICY`].
    pub async fn get_vdc_compute_policy_by_raw_name(&self, name: &str) -> PolicyResult<VdcComputePolicy> {
        let found = self
            .get_all_vdc_compute_policies(&[("name", name)])
            .try_filter(|p| futures::future::ready(p.name == name))
            .boxed()
            .try_next()
            .await?;
        found.ok_or_else(|| {
            Report::new(PolicyError::EntityNotFound {
                name: name.to_string(),
            })
        })
    }

    pub async fn get_pvdc_compute_policy(&self, name: &CsePolicyName) -> PolicyResult<PvdcComputePolicy> {
        let stored = name.stored();
        let found = self
            .get_all_pvdc_compute_policies(&[("name", stored.as_str())])?
            .try_filter(|p| futures::future::ready(p.name == stored))
            .boxed()
            .try_next()
            .await?;
        found.ok_or_else(|| {
            Report::new(PolicyError::EntityNotFound {
                name: name.display_name().to_string(),
            })
        })
    }

    /// Creates a VDC policy. A placement policy is created when
    /// `pvdc_policy_id` is given. vCD's error (400 on a duplicate name)
    /// propagates unchanged.
    pub async fn add_vdc_compute_policy(
        &self,
        name: &CsePolicyName,
        description: Option<&str>,
        pvdc_policy_id: Option<&str>,
    ) -> PolicyResult<CsePolicy> {
        let body = VdcComputePolicy {
            name: name.stored(),
            description: description.map(str::to_string),
            pvdc_compute_policy: pvdc_policy_id.map(|id| EntityReference {
                id: Some(id.to_string()),
                name: None,
            }),
            ..Default::default()
        };

        let created: VdcComputePolicy = self
            .client
            .post_json(&self.url("vdcComputePolicies"), &body)
            .await
            .change_context(PolicyError::vcd(format!("create compute policy {name}")))?;
        info!(policy = %name, placement = pvdc_policy_id.is_some(), "Created VDC compute policy");

        let href = self.policy_href(created.id.as_deref().unwrap_or_default());
        CsePolicy::from_vdc_policy(created, href).ok_or_else(|| {
            Report::new(PolicyError::vcd(format!(
                "vCD returned policy {name} without the CSE prefix"
            )))
        })
    }

    pub async fn add_pvdc_compute_policy(
        &self,
        name: &CsePolicyName,
        description: Option<&str>,
    ) -> PolicyResult<PvdcComputePolicy> {
        self.ensure_pvdc_supported()?;
        let body = PvdcComputePolicy {
            name: name.stored(),
            description: description.map(str::to_string),
            ..Default::default()
        };
        let created = self
            .client
            .post_json(&self.url("pvdcComputePolicies"), &body)
            .await
            .change_context(PolicyError::vcd(format!("create PVDC compute policy {name}")))?;
        info!(policy = %name, "Created PVDC compute policy");
        Ok(created)
    }

    /// Creates a PVDC policy and the VDC placement policy backed by it.
    pub async fn add_placement_policy(
        &self,
        name: &CsePolicyName,
        description: Option<&str>,
    ) -> PolicyResult<CsePolicy> {
        let pvdc_policy = self.add_pvdc_compute_policy(name, description).await?;
        let pvdc_id = pvdc_policy.id.ok_or_else(|| {
            Report::new(PolicyError::vcd(format!("PVDC policy {name} has no id")))
        })?;
        self.add_vdc_compute_policy(name, description, Some(&pvdc_id))
            .await
    }

    pub async fn delete_vdc_compute_policy(
        &self,
        name: &CsePolicyName,
        is_placement_policy: bool,
    ) -> PolicyResult<()> {
        let policy = self.get_vdc_compute_policy(name, is_placement_policy).await?;
        let id = policy.id.unwrap_or_default();
        self.client
            .delete(&self.policy_href(&id))
            .await
            .change_context(PolicyError::vcd(format!("delete compute policy {name}")))?;
        info!(policy = %name, "Deleted VDC compute policy");
        Ok(())
    }

    pub async fn delete_pvdc_compute_policy(&self, name: &CsePolicyName) -> PolicyResult<()> {
        let policy = self.get_pvdc_compute_policy(name).await?;
        let id = policy.id.unwrap_or_default();
        self.client
            .delete(&self.url(&format!("pvdcComputePolicies/{id}")))
            .await
            .change_context(PolicyError::vcd(format!("delete PVDC compute policy {name}")))?;
        info!(policy = %name, "Deleted PVDC compute policy");
        Ok(())
    }

    /// CSE-owned policies of one flavour, with display names.
    pub async fn list_policies(&self, is_placement_policy: bool) -> PolicyResult<Vec<CsePolicy>> {
        let prefix_filter = format!("{}*", super::naming::CSE_POLICY_PREFIX);
        let policies: Vec<VdcComputePolicy> = self
            .get_all_vdc_compute_policies(&[("name", prefix_filter.as_str())])
            .try_collect()
            .await?;

        Ok(policies
            .into_iter()
            .filter(|p| is_placement(p) == is_placement_policy)
            .filter_map(|p| {
                let href = self.policy_href(p.id.as_deref().unwrap_or_default());
                CsePolicy::from_vdc_policy(p, href)
            })
            .collect())
    }

    fn vdc_policies_url(&self, vdc_id: &str) -> String {
        self.client
            .api_url(&format!("admin/vdc/{}/computePolicies", vdc_uuid(vdc_id)))
    }

    /// Adds a policy to the VDC's assigned policies.
    pub async fn add_compute_policy_to_vdc(
        &self,
        vdc_id: &str,
        policy_href: &str,
    ) -> PolicyResult<VdcComputePolicyReferences> {
        let url = self.vdc_policies_url(vdc_id);
        let mut references: VdcComputePolicyReferences = self
            .client
            .get_json(&url)
            .await
            .change_context(PolicyError::vcd(format!("read compute policies of VDC {vdc_id}")))?;

        if references
            .vdc_compute_policy_reference
            .iter()
            .any(|r| r.href == policy_href)
        {
            debug!(vdc_id, policy_href, "Policy already assigned to VDC");
            return Ok(references);
        }

        references.vdc_compute_policy_reference.push(Reference {
            href: policy_href.to_string(),
            ..Default::default()
        });
        let updated = self
            .client
            .put_json(&url, &references)
            .await
            .change_context(PolicyError::vcd(format!("assign policy to VDC {vdc_id}")))?;
        info!(vdc_id, policy_href, "Assigned compute policy to VDC");
        Ok(updated)
    }

    /// Every compute policy assigned to a VDC.
    pub fn list_vdc_compute_policies<'a>(
        &'a self,
        vdc_id: &str,
    ) -> impl Stream<Item = PolicyResult<VdcComputePolicy>> + 'a {
        let url = self.url(&format!("vdcs/{}/computePolicies", vdc_urn(vdc_id)));
        self.client
            .paginate::<VdcComputePolicy>(url, Vec::new())
            .map(|item| item.change_context(PolicyError::vcd("list VDC compute policies")))
    }

    /// Placement policies assigned to a VDC.
    pub fn list_vdc_placement_policies<'a>(
        &'a self,
        vdc_id: &str,
    ) -> impl Stream<Item = PolicyResult<VdcComputePolicy>> + 'a {
        self.list_vdc_compute_policies(vdc_id)
            .try_filter(|p| futures::future::ready(is_placement(p)))
    }

    /// Detaches a policy from a VDC.
    ///
    /// With `force`, every VM of the VDC still using the policy is first
    /// reset, one VM at a time: sizing policies fall back to
    /// [`SYSTEM_DEFAULT_POLICY`] and placement policies are removed.
    ///
    /// When `umbrella` is given the caller owns that task and it is left
    /// `running`. Otherwise this call creates its own task and finishes it.
    pub async fn remove_compute_policy_from_vdc_sync(
        &self,
        vdc_id: &str,
        policy_href: &str,
        force: bool,
        is_placement_policy: bool,
        umbrella: Option<&ProgressTask>,
    ) -> PolicyResult<()> {
        let owned = match umbrella {
            Some(_) => None,
            None => Some(
                ProgressTask::start(
                    self.client.clone(),
                    "Removing compute policy from VDC",
                    "remove compute policy",
                    None,
                )
                .await
                .change_context(PolicyError::vcd("create task"))?,
            ),
        };
        let task = umbrella.or(owned.as_ref());

        let result = self
            .remove_policy(vdc_id, policy_href, force, is_placement_policy, task)
            .await;

        if let Some(owned) = &owned {
            match &result {
                Ok(()) => {
                    owned
                        .success(&format!("Removed compute policy from VDC {vdc_id}"))
                        .await
                }
                Err(e) => owned.error(&format!("{e}")).await,
            }
        }
        result
    }

    async fn remove_policy(
        &self,
        vdc_id: &str,
        policy_href: &str,
        force: bool,
        is_placement_policy: bool,
        task: Option<&ProgressTask>,
    ) -> PolicyResult<()> {
        let policy_id = policy_href.rsplit('/').next().unwrap_or_default().to_string();

        if force {
            let default_href = if is_placement_policy {
                None
            } else {
                let default = self.get_vdc_compute_policy_by_raw_name(SYSTEM_DEFAULT_POLICY).await?;
                Some(self.policy_href(default.id.as_deref().unwrap_or_default()))
            };
            self.reset_vms_using_policy(vdc_id, &policy_id, is_placement_policy, default_href, task)
                .await?;
        }

        if let Some(task) = task {
            task.running(&format!("Removing compute policy from VDC {vdc_id}"))
                .await;
        }

        let url = self.vdc_policies_url(vdc_id);
        let mut references: VdcComputePolicyReferences = self
            .client
            .get_json(&url)
            .await
            .change_context(PolicyError::vcd(format!("read compute policies of VDC {vdc_id}")))?;
        let before = references.vdc_compute_policy_reference.len();
        references
            .vdc_compute_policy_reference
            .retain(|r| !reference_matches(r, &policy_id));
        if references.vdc_compute_policy_reference.len() == before {
            debug!(vdc_id, policy_href, "Policy was not assigned to VDC");
            return Ok(());
        }

        self.client
            .put(&url, &references)
            .await
            .change_context(PolicyError::vcd(format!("detach policy from VDC {vdc_id}")))?;
        info!(vdc_id, policy_href, "Removed compute policy from VDC");
        Ok(())
    }

    async fn reset_vms_using_policy(
        &self,
        vdc_id: &str,
        policy_id: &str,
        is_placement_policy: bool,
        default_href: Option<String>,
        task: Option<&ProgressTask>,
    ) -> PolicyResult<()> {
        let vdc_href = self.client.api_url(&format!("vdc/{}", vdc_uuid(vdc_id)));
        let filter = construct_filter_string(&[("vdc", vdc_href.as_str())]);
        let vms: Vec<QueryRecord> = self
            .client
            .query_records::<QueryRecord>("adminVM", Some(filter))
            .try_collect()
            .await
            .change_context(PolicyError::vcd(format!("list VMs of VDC {vdc_id}")))?;

        for vm in vms.iter().filter(|vm| !vm.is_vapp_template) {
            let url = format!("{}/computePolicy", vm.href);
            let mut current: VmComputePolicy = self
                .client
                .get_json(&url)
                .await
                .change_context(PolicyError::vcd(format!("read compute policy of VM {}", vm.name)))?;

            let uses_policy = if is_placement_policy {
                current
                    .vm_placement_policy
                    .as_ref()
                    .is_some_and(|r| reference_matches(r, policy_id))
            } else {
                current
                    .vm_sizing_policy
                    .as_ref()
                    .is_some_and(|r| reference_matches(r, policy_id))
            };
            if !uses_policy {
                continue;
            }

            if let Some(task) = task {
                task.running(&format!("Resetting compute policy of VM {}", vm.name))
                    .await;
            }
            if is_placement_policy {
                current.vm_placement_policy = None;
            } else {
                current.vm_sizing_policy = default_href.clone().map(|href| Reference {
                    href,
                    ..Default::default()
                });
            }
            self.apply_vm_policy(&url, &current, &vm.name).await?;
        }
        Ok(())
    }

    async fn apply_vm_policy(&self, url: &str, policy: &VmComputePolicy, vm_name: &str) -> PolicyResult<()> {
        let response = self
            .client
            .put(url, policy)
            .await
            .change_context(PolicyError::vcd(format!("update compute policy of VM {vm_name}")))?;
        if let Some(href) = response.task_href() {
            self.client
                .wait_for_success(&href)
                .await
                .change_context(PolicyError::vcd(format!("update compute policy of VM {vm_name}")))?;
        }
        debug!(vm = vm_name, "Updated VM compute policy");
        Ok(())
    }

    async fn template_vms(&self, catalog_name: &str, template_name: &str) -> PolicyResult<Vec<Reference>> {
        let filter = construct_filter_string(&[("catalogName", catalog_name), ("name", template_name)]);
        let item = self
            .client
            .query_records::<QueryRecord>("adminCatalogItem", Some(filter))
            .boxed()
            .try_next()
            .await
            .change_context(PolicyError::vcd("find catalog item"))?
            .ok_or_else(|| {
                Report::new(PolicyError::EntityNotFound {
                    name: format!("{catalog_name}/{template_name}"),
                })
            })?;
        let template_href = item.entity.ok_or_else(|| {
            Report::new(PolicyError::vcd(format!(
                "catalog item {template_name} has no vApp template"
            )))
        })?;
        let template: VApp = self
            .client
            .get_json(&template_href)
            .await
            .change_context(PolicyError::vcd(format!("read vApp template {template_name}")))?;
        Ok(template.vms().to_vec())
    }

    /// Tags every VM of a template with `policy`.
    pub async fn assign_compute_policy_to_vapp_template_vms(
        &self,
        policy: &CsePolicy,
        catalog_name: &str,
        template_name: &str,
    ) -> PolicyResult<()> {
        let reference = Reference {
            href: policy.href.clone(),
            id: Some(policy.id.clone()),
            name: Some(policy.name.clone()),
            kind: None,
        };
        for vm in self.template_vms(catalog_name, template_name).await? {
            let url = format!("{}/computePolicy", vm.href);
            let mut current: VmComputePolicy = self
                .client
                .get_json(&url)
                .await
                .change_context(PolicyError::vcd("read template VM compute policy"))?;
            if policy.is_placement {
                current.vm_placement_policy = Some(reference.clone());
            } else {
                current.vm_sizing_policy = Some(reference.clone());
            }
            self.apply_vm_policy(&url, &current, vm.name.as_deref().unwrap_or_default())
                .await?;
        }
        info!(
            policy = %policy.display_name,
            catalog = catalog_name,
            template = template_name,
            "Assigned compute policy to template VMs"
        );
        Ok(())
    }

    /// Sets the placement policy of one deployed VM, keeping its sizing.
    pub async fn assign_placement_policy_to_vm(
        &self,
        vm: &Reference,
        policy: &CsePolicy,
    ) -> PolicyResult<()> {
        let vm_name = vm.name.as_deref().unwrap_or_default();
        let url = format!("{}/computePolicy", vm.href);
        let mut current: VmComputePolicy = self
            .client
            .get_json(&url)
            .await
            .change_context(PolicyError::vcd(format!("read compute policy of VM {vm_name}")))?;
        if current
            .vm_placement_policy
            .as_ref()
            .is_some_and(|r| reference_matches(r, &policy.id))
        {
            return Ok(());
        }
        current.vm_placement_policy = Some(Reference {
            href: policy.href.clone(),
            id: Some(policy.id.clone()),
            name: Some(policy.name.clone()),
            kind: None,
        });
        self.apply_vm_policy(&url, &current, vm_name).await
    }

    /// Clears sizing and placement policies from every VM of a template.
    pub async fn remove_all_compute_policies_from_vapp_template_vms(
        &self,
        catalog_name: &str,
        template_name: &str,
    ) -> PolicyResult<()> {
        for vm in self.template_vms(catalog_name, template_name).await? {
            let url = format!("{}/computePolicy", vm.href);
            self.apply_vm_policy(&url, &VmComputePolicy::default(), vm.name.as_deref().unwrap_or_default())
                .await?;
        }
        info!(
            catalog = catalog_name,
            template = template_name,
            "Removed compute policies from template VMs"
        );
        Ok(())
    }
}

fn reference_matches(reference: &Reference, policy_id: &str) -> bool {
    reference.id.as_deref() == Some(policy_id) || reference.href.ends_with(policy_id)
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

    const POLICIES: &str = "/cloudapi/2.0.0/vdcComputePolicies";

    async fn manager(server: &MockServer) -> ComputePolicyManager {
        Mock::given(method("GET"))
            .and(path(POLICIES))
            .and(query_param("pageSize", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(server)
            .await;
        let client = VcdClient::new(ClientConfig::new(server.uri()).with_api_version("36.0"))
            .expect("client")
            .with_token("t");
        ComputePolicyManager::new(client).await.expect("manager")
    }

    async fn mount_listing(server: &MockServer, values: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(POLICIES))
            .and(query_param("page", "1"))
            .and(query_param("pageSize", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": values})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(POLICIES))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(server)
            .await;
    }

    #[test(tokio::test)]
    async fn failing_probe_is_operation_not_supported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(POLICIES))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = VcdClient::new(ClientConfig::new(server.uri())).expect("client");
        let err = ComputePolicyManager::new(client)
            .await
            .expect_err("probe should fail");
        assert!(matches!(
            err.current_context(),
            PolicyError::OperationNotSupported { .. }
        ));
    }

    #[test(tokio::test)]
    async fn added_policy_is_listed_by_display_name() {
        let server = MockServer::start().await;
        let manager = manager(&server).await;

        Mock::given(method("POST"))
            .and(path(POLICIES))
            .and(body_partial_json(json!({"name": "cse----my-policy"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "urn:vcloud:vdcComputePolicy:1",
                "name": "cse----my-policy",
                "description": "d",
                "isSizingOnly": true
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_listing(
            &server,
            json!([
                {"id": "urn:vcloud:vdcComputePolicy:1", "name": "cse----my-policy", "isSizingOnly": true},
                {"id": "urn:vcloud:vdcComputePolicy:2", "name": "cse----native", "pvdcComputePolicy": {"id": "p"}}
            ]),
        )
        .await;

        let name = CsePolicyName::new("my-policy").expect("valid");
        let created = manager
            .add_vdc_compute_policy(&name, Some("d"), None)
            .await
            .expect("created");
        assert_eq!(created.display_name, "my-policy");
        assert_eq!(created.name, "cse----my-policy");

        let sizing = manager.list_policies(false).await.expect("listed");
        assert_eq!(sizing.len(), 1);
        assert_eq!(sizing[0].display_name, "my-policy");

        let placement = manager.list_policies(true).await.expect("listed");
        assert_eq!(placement[0].display_name, "native");
    }

    #[test(tokio::test)]
    async fn duplicate_policy_error_propagates_http_status() {
        let server = MockServer::start().await;
        let manager = manager(&server).await;
        Mock::given(method("POST"))
            .and(path(POLICIES))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "duplicate"})))
            .mount(&server)
            .await;

        let name = CsePolicyName::new("dup").expect("valid");
        let err = manager
            .add_vdc_compute_policy(&name, None, None)
            .await
            .expect_err("duplicate");
        assert_eq!(vcd_client::http_status(&err), Some(400));
    }

    #[test(tokio::test)]
    async fn missing_policy_is_entity_not_found() {
        let server = MockServer::start().await;
        let manager = manager(&server).await;
        mount_listing(
            &server,
            json!([{"id": "x", "name": "cse----native", "isSizingOnly": true}]),
        )
        .await;

        let name = CsePolicyName::new("native").expect("valid");
        let err = manager
            .get_vdc_compute_policy(&name, true)
            .await
            .expect_err("sizing policy must not match a placement lookup");
        assert!(matches!(
            err.current_context(),
            PolicyError::EntityNotFound { .. }
        ));
    }

    #[test(tokio::test)]
    async fn pvdc_policies_need_api_35() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/1.0.0/vdcComputePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        let client = VcdClient::new(ClientConfig::new(server.uri()).with_api_version("34.0"))
            .expect("client");
        let manager = ComputePolicyManager::new(client).await.expect("manager");

        let name = CsePolicyName::new("native").expect("valid");
        let err = manager
            .add_pvdc_compute_policy(&name, None)
            .await
            .expect_err("unsupported");
        assert!(matches!(
            err.current_context(),
            PolicyError::GlobalPvdcComputePolicyNotSupported { .. }
        ));
    }

    #[test(tokio::test)]
    async fn assigning_to_vdc_appends_reference() {
        let server = MockServer::start().await;
        let manager = manager(&server).await;
        let url = "/api/admin/vdc/abc/computePolicies";
        Mock::given(method("GET"))
            .and(path(url))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [{"href": "https://vcd/p/1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(url))
            .and(body_partial_json(json!({
                "vdcComputePolicyReference": [{"href": "https://vcd/p/1"}, {"href": "https://vcd/p/2"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [{"href": "https://vcd/p/1"}, {"href": "https://vcd/p/2"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refs = manager
            .add_compute_policy_to_vdc("urn:vcloud:vdc:abc", "https://vcd/p/2")
            .await
            .expect("assigned");
        assert_eq!(refs.vdc_compute_policy_reference.len(), 2);
    }

    #[test(tokio::test)]
    async fn removing_with_umbrella_task_leaves_task_alone() {
        let server = MockServer::start().await;
        let manager = manager(&server).await;
        let url = "/api/admin/vdc/abc/computePolicies";
        Mock::given(method("GET"))
            .and(path(url))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [
                    {"href": "https://vcd/cloudapi/2.0.0/vdcComputePolicies/urn:vcloud:vdcComputePolicy:1"},
                    {"href": "https://vcd/cloudapi/2.0.0/vdcComputePolicies/urn:vcloud:vdcComputePolicy:2"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(url))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{}/api/task/1", server.uri()),
                "status": "running"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/task/1"))
            .and(body_partial_json(json!({"status": "running"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{}/api/task/1", server.uri()),
                "status": "running"
            })))
            .mount(&server)
            .await;

        let umbrella = ProgressTask::start(manager.client().clone(), "umbrella", "op", None)
            .await
            .expect("task");
        manager
            .remove_compute_policy_from_vdc_sync(
                "abc",
                "https://vcd/cloudapi/2.0.0/vdcComputePolicies/urn:vcloud:vdcComputePolicy:2",
                false,
                true,
                Some(&umbrella),
            )
            .await
            .expect("removed");

        let requests = server.received_requests().await.expect("recording enabled");
        let finished = requests.iter().any(|r| {
            r.url.path() == "/api/task/1"
                && String::from_utf8_lossy(&r.body).contains("\"success\"")
        });
        assert!(!finished, "umbrella task must stay running");
    }

    #[test(tokio::test)]
    async fn forced_sizing_removal_resets_vms_to_system_default() {
        let server = MockServer::start().await;
        let uri = server.uri();
        let manager = manager(&server).await;
        let policy = "urn:vcloud:vdcComputePolicy:2";
        let policy_href = format!("https://vcd/cloudapi/2.0.0/vdcComputePolicies/{policy}");

        mount_listing(
            &server,
            json!([{"id": "urn:vcloud:vdcComputePolicy:default", "name": "System Default"}]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("type", "adminVM"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 3, "page": 1, "pageSize": 25,
                "record": [
                    {"href": format!("{uri}/api/vApp/vm-1"), "name": "uses-policy"},
                    {"href": format!("{uri}/api/vApp/vm-2"), "name": "other-policy"},
                    {"href": format!("{uri}/api/vApp/vm-3"), "name": "template", "isVAppTemplate": true}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vApp/vm-1/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vmSizingPolicy": {"href": policy_href.clone()}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vApp/vm-2/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vmSizingPolicy": {"href": "https://vcd/cloudapi/2.0.0/vdcComputePolicies/urn:vcloud:vdcComputePolicy:9"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/vApp/vm-1/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/vApp/vm-2/computePolicy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vApp/vm-3/computePolicy"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/admin/vdc/abc/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vdcComputePolicyReference": [{"href": policy_href.clone()}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/admin/vdc/abc/computePolicies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/task/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "href": format!("{uri}/api/task/1"), "status": "running"
            })))
            .mount(&server)
            .await;

        manager
            .remove_compute_policy_from_vdc_sync("urn:vcloud:vdc:abc", &policy_href, true, false, None)
            .await
            .expect("removed");

        let requests = server.received_requests().await.expect("recording enabled");
        let vm_update = requests
            .iter()
            .find(|r| r.method.to_string() == "PUT" && r.url.path() == "/api/vApp/vm-1/computePolicy")
            .expect("vm reset");
        let body: serde_json::Value = serde_json::from_slice(&vm_update.body).expect("json body");
        let reset_to = body["vmSizingPolicy"]["href"].as_str().unwrap_or_default();
        assert!(reset_to.ends_with("urn:vcloud:vdcComputePolicy:default"), "{reset_to}");

        let last_task_update = requests
            .iter()
            .filter(|r| r.method.to_string() == "PUT" && r.url.path() == "/api/task/1")
            .last()
            .expect("task finished");
        let body: serde_json::Value = serde_json::from_slice(&last_task_update.body).expect("json body");
        assert_eq!(body["status"], "success");
    }
}

