//! Install, upgrade and installation check.

pub mod cluster_migration;
pub mod error;
pub mod extension;
pub mod rde;
pub mod rights;
pub mod upgrade;

use error_stack::Report;
use error_stack::ResultExt;
use semver::Version;
use tracing::info;
use tracing::warn;
use vcd_client::VcdClient;

pub use error::InstallError;
pub use error::InstallResult;
pub use error::UpgradeError;
use extension::ExtensionDescription;
use extension::ExtensionKind;
use extension::ExtensionManager;
use extension::MqttToken;
use rde::RdeRegistrar;
use upgrade::plan_upgrade;
use upgrade::UpgradeInputs;
use upgrade::UpgradeStep;

use crate::compute_policy::ComputePolicyManager;
use crate::compute_policy::CsePolicyName;
use crate::compute_policy::K8sRuntime;
use crate::config::schema::AmqpConfig;
use crate::config::CseConfig;
use crate::tasks::TaskRunner;
use crate::telemetry::CseOperation;
use crate::telemetry::OperationStatus;
use crate::telemetry::TelemetryClient;
use crate::template;
use crate::template::BuildOptions;

/// Knobs shared by `install` and `upgrade`.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub skip_template_creation: bool,
    pub retain_temp_vapp: bool,
    pub ssh_key: Option<String>,
}

impl InstallOptions {
    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            retain_temp_vapp: self.retain_temp_vapp,
            ssh_key: self.ssh_key.clone(),
            ..Default::default()
        }
    }
}

/// What `install` or `upgrade` changed that the caller has to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Token of a newly registered MQTT extension, to be written to the
    /// `mqtt` config section.
    pub mqtt_token: Option<MqttToken>,
    pub templates_built: Vec<String>,
}

/// State of an installation as seen by `check --check-install`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationReport {
    pub extension: ExtensionKind,
    pub description: ExtensionDescription,
    pub placement_policies: Vec<String>,
    pub templates: Vec<String>,
}

pub fn current_version() -> InstallResult<Version> {
    Version::parse(utils::version::CSE_VERSION)
        .change_context(InstallError::Version)
        .attach_printable_lazy(|| utils::version::CSE_VERSION.to_string())
}

/// Runs install, upgrade and check against one vCD with one config.
pub struct Installer {
    client: VcdClient,
    config: CseConfig,
    runner: TaskRunner,
    telemetry: TelemetryClient,
}

impl Installer {
    pub fn new(client: VcdClient, config: CseConfig, telemetry: TelemetryClient) -> Self {
        let runner = TaskRunner::new(config.service.processors);
        Self {
            client,
            config,
            runner,
            telemetry,
        }
    }

    fn api_version(&self) -> InstallResult<f64> {
        self.client
            .config()
            .api_version_number()
            .change_context(InstallError::vcd("read API version"))
    }

    fn target_rde_version(&self) -> InstallResult<Option<String>> {
        if self.config.legacy_mode() {
            return Ok(None);
        }
        let api_version = self.api_version()?;
        rde::rde_version_for_api(api_version)
            .map(|v| Some(v.to_string()))
            .ok_or_else(|| {
                Report::new(InstallError::Rde {
                    message: format!("vCD API {api_version} has no RDE support, enable legacy_mode"),
                })
            })
    }

    fn target_description(&self) -> InstallResult<ExtensionDescription> {
        Ok(ExtensionDescription {
            cse_version: current_version()?,
            vcd_api_version: self.config.vcd.api_version.clone(),
            legacy_mode: self.config.legacy_mode(),
            rde_version_in_use: self.target_rde_version()?,
        })
    }

    async fn policy_manager(&self) -> InstallResult<ComputePolicyManager> {
        ComputePolicyManager::new(self.client.clone())
            .await
            .change_context(InstallError::vcd("open compute policy manager"))
    }

    async fn record<T>(&self, operation: CseOperation, result: InstallResult<T>) -> InstallResult<T> {
        let status = if result.is_ok() {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        };
        self.telemetry.record(operation, status).await;
        result
    }

    pub async fn install(&self, options: &InstallOptions) -> InstallResult<InstallOutcome> {
        let result = self.install_steps(options).await;
        self.record(CseOperation::ServiceInstall, result).await
    }

    async fn install_steps(&self, options: &InstallOptions) -> InstallResult<InstallOutcome> {
        let extensions = ExtensionManager::new(self.client.clone());
        if extensions.detect_kind().await? != ExtensionKind::None {
            return Err(Report::new(InstallError::AlreadyInstalled));
        }
        let description = self.target_description()?;
        let mut outcome = InstallOutcome::default();

        if self.config.legacy_mode() {
            let extension = extensions.register_amqp(self.amqp()?, &description).await?;
            if let Some(href) = &extension.href {
                rights::register_legacy_rights(&self.client, href).await?;
            }
        } else {
            let (_, token) = extensions.register_mqtt(&description).await?;
            outcome.mqtt_token = Some(token);
        }

        if let Some(version) = &description.rde_version_in_use {
            RdeRegistrar::new(self.client.clone()).register(version).await?;
            rights::register_entity_rights(&self.client).await?;
            self.ensure_placement_policies(&self.policy_manager().await?).await?;
        }

        outcome.templates_built = self.install_templates(options).await?;
        info!(version = %description.cse_version, legacy = description.legacy_mode, "CSE installed");
        Ok(outcome)
    }

    /// Creates the placement policy of every runtime that has none.
    pub async fn ensure_placement_policies(&self, manager: &ComputePolicyManager) -> InstallResult<()> {
        let existing = manager
            .list_policies(true)
            .await
            .change_context(InstallError::vcd("list placement policies"))?;
        for runtime in K8sRuntime::ALL {
            if existing
                .iter()
                .any(|p| p.display_name == runtime.policy_display_name())
            {
                continue;
            }
            manager
                .add_placement_policy(&runtime.policy_name(), Some(runtime.description()))
                .await
                .change_context(InstallError::vcd(format!(
                    "create placement policy {}",
                    runtime.policy_display_name()
                )))?;
        }
        Ok(())
    }

    async fn install_templates(&self, options: &InstallOptions) -> InstallResult<Vec<String>> {
        if options.skip_template_creation {
            info!("Skipping template creation");
            return Ok(Vec::new());
        }
        let (builder, cookbook) = template::open_builder(&self.client, &self.config, options.build_options())
            .await
            .change_context(InstallError::Template {
                step: "open catalog".into(),
            })?;
        template::install_templates(
            &builder,
            &cookbook,
            &current_version()?,
            self.config.legacy_mode(),
            None,
        )
        .await
        .change_context(InstallError::Template {
            step: "install templates".into(),
        })
    }

    pub async fn upgrade(&self, options: &InstallOptions) -> InstallResult<InstallOutcome> {
        let result = self.upgrade_steps(options).await;
        self.record(CseOperation::ServiceUpgrade, result).await
    }

    async fn tkgm_policy_present(&self) -> InstallResult<bool> {
        if self.api_version()? < 35.0 {
            return Ok(false);
        }
        let policies = self
            .policy_manager()
            .await?
            .list_policies(true)
            .await
            .change_context(InstallError::vcd("list placement policies"))?;
        Ok(policies
            .iter()
            .any(|p| p.display_name == K8sRuntime::Tkgm.policy_display_name()))
    }

    /// Reads the installed state and checks the transition.
    pub async fn plan(&self) -> InstallResult<(ExtensionKind, Vec<UpgradeStep>)> {
        let extensions = ExtensionManager::new(self.client.clone());
        let installed = extensions.detect_kind().await?;
        let source = extensions.description(installed).await?;
        let target = self.target_description()?;

        let inputs = UpgradeInputs {
            installed,
            source_version: source
                .as_ref()
                .map(|d| d.cse_version.clone())
                .unwrap_or_else(|| Version::new(0, 0, 0)),
            source_legacy: source.as_ref().is_some_and(|d| d.legacy_mode),
            target_version: target.cse_version.clone(),
            target_legacy: target.legacy_mode,
            target_rde_version: target.rde_version_in_use.clone(),
            source_rde_version: source.and_then(|d| d.rde_version_in_use),
            tkgm_policy_present: installed != ExtensionKind::None && self.tkgm_policy_present().await?,
        };
        let steps = plan_upgrade(&inputs).change_context(InstallError::Upgrade)?;
        Ok((installed, steps))
    }

    async fn upgrade_steps(&self, options: &InstallOptions) -> InstallResult<InstallOutcome> {
        let (mut kind, steps) = self.plan().await?;
        let description = self.target_description()?;
        let extensions = ExtensionManager::new(self.client.clone());
        let registrar = RdeRegistrar::new(self.client.clone());
        let mut outcome = InstallOutcome::default();
        let mut clusters = None;
        info!(steps = steps.len(), "Upgrade planned");

        for step in steps {
            info!(?step, "Running upgrade step");
            match step {
                UpgradeStep::UpdateAmqpExtension => {
                    extensions.update_amqp(self.amqp()?, &description).await?;
                }
                UpgradeStep::SwitchAmqpToMqtt => {
                    extensions.unregister_amqp().await?;
                    let (_, token) = extensions.register_mqtt(&description).await?;
                    outcome.mqtt_token = Some(token);
                    kind = ExtensionKind::Mqtt;
                }
                UpgradeStep::RegisterRde { version } => registrar.register(&version).await?,
                UpgradeStep::EnsurePlacementPolicies => {
                    self.ensure_placement_policies(&self.policy_manager().await?).await?;
                }
                UpgradeStep::RemoveLegacySizingPolicies => {
                    let manager = self.policy_manager().await?;
                    let sizing = manager
                        .list_policies(false)
                        .await
                        .change_context(InstallError::vcd("list sizing policies"))?;
                    for policy in sizing {
                        let name = CsePolicyName::new(policy.display_name.clone())
                            .change_context(InstallError::vcd("read sizing policy name"))?;
                        manager
                            .delete_vdc_compute_policy(&name, false)
                            .await
                            .change_context(InstallError::vcd(format!("delete sizing policy {name}")))?;
                    }
                }
                UpgradeStep::AssignPlacementPoliciesToClusters => {
                    let found = cluster_migration::discover_legacy_clusters(&self.client).await?;
                    cluster_migration::assign_placement_policies(&self.policy_manager().await?, &found).await?;
                    clusters = Some(found);
                }
                UpgradeStep::CreateEntitiesForLegacyClusters { version } => {
                    let found = match clusters.take() {
                        Some(found) => found,
                        None => cluster_migration::discover_legacy_clusters(&self.client).await?,
                    };
                    cluster_migration::create_entities_for_legacy_clusters(&self.client, &self.runner, found, &version)
                        .await
                        .into_result("entity creation")?;
                }
                UpgradeStep::MigrateClusterEntities { from, to } => {
                    cluster_migration::migrate_cluster_entities(&self.client, &self.runner, &from, &to)
                        .await?
                        .into_result("entity migration")?;
                }
                UpgradeStep::DeleteOrphanedEntityTypes { keep } => {
                    registrar.delete_orphaned_entity_types(&keep).await?;
                }
                UpgradeStep::ReinstallTemplates => {
                    outcome.templates_built = self.install_templates(options).await?;
                }
                UpgradeStep::RegisterRights => rights::register_entity_rights(&self.client).await?,
                UpgradeStep::UpdateExtensionDescription => match kind {
                    ExtensionKind::Mqtt => extensions.update_mqtt_description(&description).await?,
                    ExtensionKind::Amqp => extensions.update_amqp(self.amqp()?, &description).await?,
                    ExtensionKind::None => {}
                },
            }
        }
        info!(version = %description.cse_version, "CSE upgraded");
        Ok(outcome)
    }

    fn amqp(&self) -> InstallResult<&AmqpConfig> {
        self.config.amqp.as_ref().ok_or_else(|| {
            Report::new(InstallError::Check {
                message: "legacy mode needs an amqp section".into(),
            })
        })
    }

    /// Compares what is registered on vCD with the config.
    pub async fn check(&self) -> InstallResult<InstallationReport> {
        let extensions = ExtensionManager::new(self.client.clone());
        let kind = extensions.detect_kind().await?;
        let description = extensions.description(kind).await?.ok_or_else(|| {
            Report::new(InstallError::Check {
                message: "CSE is not registered with vCD".into(),
            })
        })?;

        let current = current_version()?;
        if description.cse_version != current {
            return Err(Report::new(InstallError::Check {
                message: format!(
                    "registered CSE version {} differs from {current}, run 'cse upgrade'",
                    description.cse_version
                ),
            }));
        }
        if description.legacy_mode != self.config.legacy_mode() {
            return Err(Report::new(InstallError::Check {
                message: format!(
                    "CSE was installed with legacy_mode={}, config says {}",
                    description.legacy_mode,
                    self.config.legacy_mode()
                ),
            }));
        }
        match (kind, self.config.legacy_mode()) {
            (ExtensionKind::Mqtt, true) | (ExtensionKind::Amqp, false) => {
                return Err(Report::new(InstallError::Check {
                    message: "registered extension type does not match legacy_mode".into(),
                }));
            }
            _ => {}
        }
        if kind == ExtensionKind::Amqp && !extensions.has_api_filter().await? {
            return Err(Report::new(InstallError::Check {
                message: "AMQP extension has no API filter for /api/cse".into(),
            }));
        }

        let mut placement_policies = Vec::new();
        if let Some(version) = &description.rde_version_in_use {
            if !RdeRegistrar::new(self.client.clone()).is_registered(version).await? {
                return Err(Report::new(InstallError::Check {
                    message: format!("entity type {} is not registered", rde::entity_type_id(version)),
                }));
            }
            let policies = self
                .policy_manager()
                .await?
                .list_policies(true)
                .await
                .change_context(InstallError::vcd("list placement policies"))?;
            placement_policies = policies.into_iter().map(|p| p.display_name).collect();
            for runtime in K8sRuntime::ALL {
                if !placement_policies
                    .iter()
                    .any(|p| p == runtime.policy_display_name())
                {
                    warn!(policy = runtime.policy_display_name(), "Placement policy missing");
                }
            }
        }

        let broker = &self.config.broker;
        let templates = template::Catalog::open(self.client.clone(), &broker.org, &broker.catalog)
            .await
            .change_context(InstallError::Check {
                message: format!("catalog '{}' is missing", broker.catalog),
            })?
            .templates()
            .await
            .change_context(InstallError::Check {
                message: "failed to read templates".into(),
            })?
            .iter()
            .map(|t| t.catalog_item_name())
            .collect();

        info!(extension = ?kind, version = %description.cse_version, "Installation is valid");
        Ok(InstallationReport {
            extension: kind,
            description,
            placement_policies,
            templates,
        })
    }
}
