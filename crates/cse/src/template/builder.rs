//! Template install and import.
//!
//! Install builds a template from the cookbook: the source OVA is uploaded
//! once, a temporary vApp is instantiated from it and customized by a
//! guest customization script, and the powered off vApp is captured as
//! `<name>_rev<revision>`. Import uploads a ready made TKGm OVA as is.

use std::path::Path;
use std::time::Duration;

use api_types::VApp;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use tracing::info;
use tracing::warn;
use vcd_client::VcdClient;

use super::catalog::wait;
use super::catalog::Catalog;
use super::cookbook::CookbookClient;
use super::cookbook::RemoteTemplate;
use super::error::TemplateError;
use super::error::TemplateResult;
use super::metadata::TemplateMetadata;
use super::ova::upload_ova;
use super::ova::verify_checksum;
use super::ova::OvaFile;
use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::K8sRuntime;

const GUEST_CUSTOMIZATION_COMPLETE: &str = "GC_COMPLETE";
const TKGM_MIN_CSE_VERSION: &str = "3.1.0";

/// Knobs of `template install` and `template import`.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Replace templates that already exist.
    pub force: bool,
    pub retain_temp_vapp: bool,
    /// Public key authorized on the temporary vApp, for debugging.
    pub ssh_key: Option<String>,
    pub customization_poll_interval: Duration,
    pub customization_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            force: false,
            retain_temp_vapp: false,
            ssh_key: None,
            customization_poll_interval: Duration::from_secs(10),
            customization_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Where temporary vApps are deployed.
#[derive(Debug, Clone)]
pub struct Placement {
    pub vdc_href: String,
    pub network: String,
    pub storage_profile: String,
    pub ip_allocation_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestCustomizationStatus {
    #[serde(default)]
    guest_cust_status: String,
}

/// Appends the commands authorizing `ssh_key` for root.
pub fn script_with_ssh_key(script: &str, ssh_key: Option<&str>) -> String {
    let Some(key) = ssh_key.map(str::trim).filter(|k| !k.is_empty()) else {
        return script.to_string();
    };
    let mut script = script.trim_end().to_string();
    script.push_str(&format!(
        "\nmkdir -p /root/.ssh\necho '{key}' >> /root/.ssh/authorized_keys\nchmod -R go-rwx /root/.ssh\n"
    ));
    script
}

pub fn temp_vapp_name(template: &TemplateMetadata) -> String {
    format!("{}_temp", template.catalog_item_name())
}

/// Template metadata of a TKGm OVA, read from its file name, e.g.
/// `ubuntu-2004-kube-v1.20.5-vmware.2-tkg.1-6700972457122900687.ova`.
pub fn tkgm_metadata_from_file_name(file_name: &str) -> TemplateMetadata {
    let stem = file_name.strip_suffix(".ova").unwrap_or(file_name);
    let (os_part, kube_part) = stem.split_once("-kube-").unwrap_or((stem, ""));

    let os = match os_part.rsplit_once('-') {
        Some((distro, release)) if release.len() == 4 && release.chars().all(|c| c.is_ascii_digit()) => {
            format!("{distro}-{}.{}", &release[..2], &release[2..])
        }
        _ => os_part.to_string(),
    };
    let mut parts = kube_part.split('-');
    let kubernetes_version = match (parts.next(), parts.next()) {
        (Some(version), Some(build)) if build.starts_with("vmware") => format!("{version}+{build}"),
        (Some(version), _) => version.to_string(),
        _ => String::new(),
    };

    TemplateMetadata {
        name: stem.to_string(),
        revision: 1,
        description: format!("TKGm template {kubernetes_version} on {os}"),
        os,
        kubernetes: K8sRuntime::Tkgm.label().to_string(),
        kubernetes_version,
        cni: "antrea".to_string(),
        kind: K8sRuntime::Tkgm.label().to_string(),
        compute_policy: K8sRuntime::Tkgm.policy_display_name().to_string(),
        min_cse_version: TKGM_MIN_CSE_VERSION.to_string(),
        ..Default::default()
    }
}

/// Installs and imports templates into the CSE catalog.
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    client: VcdClient,
    catalog: Catalog,
    placement: Placement,
    /// Tags templates with their runtime's placement policy; `None` in
    /// legacy mode.
    policies: Option<ComputePolicyManager>,
    options: BuildOptions,
}

impl TemplateBuilder {
    pub fn new(
        catalog: Catalog,
        placement: Placement,
        policies: Option<ComputePolicyManager>,
        options: BuildOptions,
    ) -> Self {
        Self {
            client: catalog.client().clone(),
            catalog,
            placement,
            policies,
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Skips existing templates unless forced. Returns whether the template
    /// was (re)built.
    pub async fn install(&self, cookbook: &CookbookClient, remote: &RemoteTemplate) -> TemplateResult<bool> {
        let template = &remote.metadata;
        let item_name = template.catalog_item_name();
        if self.catalog.find_item(&item_name).await?.is_some() {
            if !self.options.force {
                info!(template = %item_name, "Template exists, skipping");
                return Ok(false);
            }
            self.catalog.delete_item(&item_name).await?;
        }

        self.ensure_source_ova(cookbook, remote).await?;
        let script = cookbook.customization_script(template).await?;
        let script = script_with_ssh_key(&script, self.options.ssh_key.as_deref());

        let vapp_name = temp_vapp_name(template);
        let vapp = self.instantiate_temp_vapp(remote, &vapp_name).await?;
        let result = self.customize_and_capture(&vapp, template, &script).await;

        if self.options.retain_temp_vapp {
            info!(vapp = %vapp_name, "Keeping temporary vApp");
        } else if let Err(e) = self.delete_vapp(&vapp.href).await {
            warn!(vapp = %vapp_name, "Failed to delete temporary vApp: {e:?}");
        }
        result?;
        info!(template = %item_name, "Installed template");
        Ok(true)
    }

    /// Imports a TKGm OVA from disk. `name` and `revision` override what
    /// the file name says.
    pub async fn import(
        &self,
        ova_path: &Path,
        name: Option<&str>,
        revision: Option<u32>,
    ) -> TemplateResult<TemplateMetadata> {
        let file_name = ova_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut template = tkgm_metadata_from_file_name(&file_name);
        if let Some(name) = name {
            template.name = name.to_string();
        }
        if let Some(revision) = revision {
            template.revision = revision;
        }
        let item_name = template.catalog_item_name();

        if self.catalog.find_item(&item_name).await?.is_some() {
            if !self.options.force {
                return Err(Report::new(TemplateError::vcd(format!(
                    "template {item_name} already exists, use --force to replace it"
                ))));
            }
            self.catalog.delete_item(&item_name).await?;
        }

        let path = ova_path.to_path_buf();
        let ova = tokio::task::spawn_blocking(move || OvaFile::open(&path))
            .await
            .change_context(TemplateError::Io {
                path: ova_path.display().to_string(),
            })??;
        let item = upload_ova(&self.catalog, &ova, &item_name, &template.description).await?;
        self.finish(&item.href, &template).await?;
        info!(template = %item_name, "Imported template");
        Ok(template)
    }

    async fn ensure_source_ova(&self, cookbook: &CookbookClient, remote: &RemoteTemplate) -> TemplateResult<()> {
        if self.catalog.find_item(&remote.source_ova_name).await?.is_some() {
            if !self.options.force {
                return Ok(());
            }
            self.catalog.delete_item(&remote.source_ova_name).await?;
        }

        let dest = std::env::temp_dir().join(&remote.source_ova_name);
        cookbook.download_ova(remote, &dest).await?;
        let result = self.upload_source_ova(remote, &dest).await;
        if let Err(e) = tokio::fs::remove_file(&dest).await {
            warn!(path = %dest.display(), "Failed to remove downloaded OVA: {e}");
        }
        result
    }

    async fn upload_source_ova(&self, remote: &RemoteTemplate, path: &Path) -> TemplateResult<()> {
        let checked = path.to_path_buf();
        let expected = remote.sha256_ova.clone();
        let ova = tokio::task::spawn_blocking(move || {
            verify_checksum(&checked, &expected)?;
            OvaFile::open(&checked)
        })
        .await
        .change_context(TemplateError::Io {
            path: path.display().to_string(),
        })??;
        upload_ova(&self.catalog, &ova, &remote.source_ova_name, &remote.source_ova).await?;
        Ok(())
    }

    async fn instantiate_temp_vapp(&self, remote: &RemoteTemplate, vapp_name: &str) -> TemplateResult<VApp> {
        let source = self
            .catalog
            .find_item(&remote.source_ova_name)
            .await?
            .and_then(|item| item.entity)
            .ok_or_else(|| {
                Report::new(TemplateError::vcd(format!(
                    "source OVA {} missing from catalog",
                    remote.source_ova_name
                )))
            })?;
        let body = json!({
            "name": vapp_name,
            "description": format!("Temporary vApp for {}", remote.metadata.catalog_item_name()),
            "deploy": false,
            "powerOn": false,
            "instantiationParams": {
                "networkConfigSection": {
                    "networkConfig": [{
                        "networkName": self.placement.network,
                        "configuration": {
                            "parentNetwork": {"name": self.placement.network},
                            "fenceMode": "bridged",
                        },
                    }],
                },
            },
            "source": {"href": source},
            "sourcedItem": [{
                "source": {"href": source},
                "instantiationParams": {
                    "networkConnectionSection": {
                        "networkConnection": [{
                            "network": self.placement.network,
                            "networkConnectionIndex": 0,
                            "isConnected": true,
                            "ipAddressAllocationMode": self.placement.ip_allocation_mode.to_ascii_uppercase(),
                        }],
                    },
                },
                "storageProfile": {"name": self.placement.storage_profile},
            }],
            "allEULAsAccepted": true,
        });
        let response = self
            .client
            .post(
                &format!("{}/action/instantiateVAppTemplate", self.placement.vdc_href),
                &body,
            )
            .await
            .change_context(TemplateError::vcd(format!("instantiate {vapp_name}")))?;
        wait(&self.client, &response, &format!("instantiate {vapp_name}")).await?;
        let href = response
            .body
            .get("href")
            .and_then(Value::as_str)
            .ok_or_else(|| Report::new(TemplateError::vcd("instantiation answered without a vApp")))?;
        self.client
            .get_json(href)
            .await
            .change_context(TemplateError::vcd(format!("read vApp {vapp_name}")))
    }

    async fn customize_and_capture(&self, vapp: &VApp, template: &TemplateMetadata, script: &str) -> TemplateResult<()> {
        let vm = vapp
            .vms()
            .first()
            .cloned()
            .ok_or_else(|| Report::new(TemplateError::vcd(format!("vApp {} has no VM", vapp.name))))?;
        let vm_name = vm.name.clone().unwrap_or_default();

        let section_url = format!("{}/guestCustomizationSection", vm.href);
        let mut section: Value = self
            .client
            .get_json(&section_url)
            .await
            .change_context(TemplateError::vcd("read guest customization"))?;
        if let Some(section) = section.as_object_mut() {
            section.insert("enabled".into(), Value::Bool(true));
            section.insert("customizationScript".into(), Value::String(script.to_string()));
        }
        let response = self
            .client
            .put(&section_url, &section)
            .await
            .change_context(TemplateError::vcd("set customization script"))?;
        wait(&self.client, &response, "set customization script").await?;

        let response = self
            .client
            .post(&format!("{}/power/action/powerOn", vapp.href), &json!({}))
            .await
            .change_context(TemplateError::vcd("power on temporary vApp"))?;
        wait(&self.client, &response, "power on temporary vApp").await?;
        self.wait_for_customization(&vm.href, &vm_name).await?;

        let response = self
            .client
            .post(
                &format!("{}/action/undeploy", vapp.href),
                &json!({"undeployPowerAction": "powerOff"}),
            )
            .await
            .change_context(TemplateError::vcd("power off temporary vApp"))?;
        wait(&self.client, &response, "power off temporary vApp").await?;

        let item_href = self
            .catalog
            .capture_vapp(&vapp.href, &template.catalog_item_name(), &template.description)
            .await?;
        self.finish(&item_href, template).await
    }

    async fn wait_for_customization(&self, vm_href: &str, vm_name: &str) -> TemplateResult<()> {
        let url = format!("{vm_href}/guestcustomizationstatus");
        let started = tokio::time::Instant::now();
        loop {
            let status: GuestCustomizationStatus = self
                .client
                .get_json(&url)
                .await
                .change_context(TemplateError::vcd("read guest customization status"))?;
            if status.guest_cust_status == GUEST_CUSTOMIZATION_COMPLETE {
                info!(vm = vm_name, "Guest customization complete");
                return Ok(());
            }
            if started.elapsed() >= self.options.customization_timeout {
                return Err(Report::new(TemplateError::Customization {
                    vm: vm_name.to_string(),
                })
                .attach_printable(format!("last status: {}", status.guest_cust_status)));
            }
            tokio::time::sleep(self.options.customization_poll_interval).await;
        }
    }

    /// Writes metadata and tags the template VMs with the placement policy
    /// of its runtime.
    async fn finish(&self, item_href: &str, template: &TemplateMetadata) -> TemplateResult<()> {
        self.catalog.set_metadata(item_href, template).await?;
        let (Some(policies), Some(runtime)) = (&self.policies, template.runtime()) else {
            return Ok(());
        };
        let policy = policies
            .list_policies(true)
            .await
            .change_context(TemplateError::vcd("list placement policies"))?
            .into_iter()
            .find(|p| p.display_name == runtime.policy_display_name())
            .ok_or_else(|| {
                Report::new(TemplateError::vcd(format!(
                    "placement policy '{}' missing, run 'cse install' first",
                    runtime.policy_display_name()
                )))
            })?;
        policies
            .assign_compute_policy_to_vapp_template_vms(&policy, self.catalog.name(), &template.catalog_item_name())
            .await
            .change_context(TemplateError::vcd("tag template VMs"))
    }

    async fn delete_vapp(&self, href: &str) -> TemplateResult<()> {
        let response = self
            .client
            .delete(href)
            .await
            .change_context(TemplateError::vcd("delete temporary vApp"))?;
        wait(&self.client, &response, "delete temporary vApp").await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn tkgm_file_name_is_parsed() {
        let template =
            tkgm_metadata_from_file_name("ubuntu-2004-kube-v1.20.5-vmware.2-tkg.1-6700972457122900687.ova");
        assert_eq!(template.name, "ubuntu-2004-kube-v1.20.5-vmware.2-tkg.1-6700972457122900687");
        assert_eq!(template.os, "ubuntu-20.04");
        assert_eq!(template.kubernetes_version, "v1.20.5+vmware.2");
        assert_eq!(template.kind, "TKGm");
        assert_eq!(template.revision, 1);
        assert_eq!(template.runtime(), Some(K8sRuntime::Tkgm));
    }

    #[test]
    fn unusual_file_name_keeps_the_stem() {
        let template = tkgm_metadata_from_file_name("custom.ova");
        assert_eq!(template.name, "custom");
        assert_eq!(template.os, "custom");
        assert_eq!(template.kubernetes_version, "");
    }

    #[test]
    fn ssh_key_is_appended() {
        assert_eq!(script_with_ssh_key("#!/bin/bash\n", None), "#!/bin/bash\n");
        assert_eq!(script_with_ssh_key("#!/bin/bash\n", Some("  ")), "#!/bin/bash\n");
        let script = script_with_ssh_key("#!/bin/bash\n", Some("ssh-rsa AAA me"));
        assert!(script.starts_with("#!/bin/bash\nmkdir -p /root/.ssh\n"));
        assert!(script.contains("echo 'ssh-rsa AAA me' >> /root/.ssh/authorized_keys"));
    }

    #[test]
    fn temp_vapp_is_named_after_the_template() {
        let template = TemplateMetadata {
            name: "photon-v2".into(),
            revision: 3,
            ..Default::default()
        };
        assert_eq!(temp_vapp_name(&template), "photon-v2_rev3_temp");
    }
}
