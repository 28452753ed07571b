//! Upgrade planning.
//!
//! The plan is computed from what was discovered on vCD before anything is
//! touched, so every refused transition fails without side effects.

use error_stack::Report;
use semver::Version;

use super::error::UpgradeError;
use super::error::UpgradeResult;
use super::extension::ExtensionKind;

/// First release that knows about TKGm clusters.
pub const TKGM_MIN_VERSION: Version = Version::new(3, 1, 0);

/// State found on vCD and in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInputs {
    pub installed: ExtensionKind,
    pub source_version: Version,
    pub source_legacy: bool,
    pub target_version: Version,
    pub target_legacy: bool,
    /// RDE version the target registers; `None` in legacy mode.
    pub target_rde_version: Option<String>,
    pub source_rde_version: Option<String>,
    pub tkgm_policy_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeStep {
    /// Re-register the AMQP exchange, routing key and description.
    UpdateAmqpExtension,
    /// Replace the AMQP extension with an MQTT one.
    SwitchAmqpToMqtt,
    RegisterRde { version: String },
    EnsurePlacementPolicies,
    /// Sizing policies of releases before placement policies existed.
    RemoveLegacySizingPolicies,
    /// Tag clusters deployed before placement policies with the policy of
    /// their runtime.
    AssignPlacementPoliciesToClusters,
    /// Create entities for clusters that predate RDEs.
    CreateEntitiesForLegacyClusters { version: String },
    MigrateClusterEntities { from: String, to: String },
    DeleteOrphanedEntityTypes { keep: String },
    ReinstallTemplates,
    RegisterRights,
    UpdateExtensionDescription,
}

/// Checks the transition and lists the steps to run, in order.
pub fn plan_upgrade(inputs: &UpgradeInputs) -> UpgradeResult<Vec<UpgradeStep>> {
    let source = &inputs.source_version;
    let target = &inputs.target_version;

    match inputs.installed {
        ExtensionKind::None => return Err(Report::new(UpgradeError::NotInstalled)),
        ExtensionKind::Mqtt if inputs.target_legacy => {
            return Err(Report::new(UpgradeError::MqttToAmqp))
        }
        _ => {}
    }
    if target < source {
        return Err(Report::new(UpgradeError::Downgrade {
            source: source.clone(),
            target: target.clone(),
        }));
    }
    if !inputs.source_legacy && inputs.target_legacy {
        return Err(Report::new(UpgradeError::NonLegacyToLegacy {
            source: source.clone(),
        }));
    }
    if *source < TKGM_MIN_VERSION && TKGM_MIN_VERSION <= *target && inputs.tkgm_policy_present {
        return Err(Report::new(UpgradeError::UnexpectedTkgmPolicy {
            source: source.clone(),
            target: target.clone(),
        }));
    }

    let mut steps = Vec::new();
    if inputs.target_legacy {
        steps.push(UpgradeStep::UpdateAmqpExtension);
        steps.push(UpgradeStep::ReinstallTemplates);
        steps.push(UpgradeStep::UpdateExtensionDescription);
        return Ok(steps);
    }

    let rde = inputs
        .target_rde_version
        .clone()
        .unwrap_or_else(|| super::rde::RDE_VERSION_1.to_string());
    if inputs.installed == ExtensionKind::Amqp {
        steps.push(UpgradeStep::SwitchAmqpToMqtt);
    }
    steps.push(UpgradeStep::RegisterRde {
        version: rde.clone(),
    });
    steps.push(UpgradeStep::EnsurePlacementPolicies);
    if inputs.source_legacy {
        steps.push(UpgradeStep::RemoveLegacySizingPolicies);
        steps.push(UpgradeStep::AssignPlacementPoliciesToClusters);
    }
    match &inputs.source_rde_version {
        None => steps.push(UpgradeStep::CreateEntitiesForLegacyClusters {
            version: rde.clone(),
        }),
        Some(from) if *from != rde => steps.push(UpgradeStep::MigrateClusterEntities {
            from: from.clone(),
            to: rde.clone(),
        }),
        Some(_) => {}
    }
    steps.push(UpgradeStep::DeleteOrphanedEntityTypes {
        keep: super::rde::entity_type_id(&rde),
    });
    steps.push(UpgradeStep::ReinstallTemplates);
    steps.push(UpgradeStep::RegisterRights);
    steps.push(UpgradeStep::UpdateExtensionDescription);
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::install::extension::ExtensionDescription;

    fn v(text: &str) -> Version {
        Version::parse(text).expect("version")
    }

    fn inputs(source: &str, target: &str) -> UpgradeInputs {
        UpgradeInputs {
            installed: ExtensionKind::Mqtt,
            source_version: v(source),
            source_legacy: false,
            target_version: v(target),
            target_legacy: false,
            target_rde_version: Some("2.0.0".into()),
            source_rde_version: Some("1.0.0".into()),
            tkgm_policy_present: false,
        }
    }

    fn assert_refused(inputs: &UpgradeInputs, expected: UpgradeError) {
        let report = plan_upgrade(inputs).expect_err("refused");
        assert_eq!(report.current_context(), &expected);
    }

    #[test]
    fn tkgm_policy_before_3_1_is_refused() {
        let mut i = inputs("3.0.3", "3.1.0");
        i.tkgm_policy_present = true;
        assert_refused(
            &i,
            UpgradeError::UnexpectedTkgmPolicy {
                source: v("3.0.3"),
                target: v("3.1.0"),
            },
        );

        i.tkgm_policy_present = false;
        assert!(plan_upgrade(&i).is_ok());
    }

    #[test]
    fn refused_transitions() {
        let mut i = inputs("3.1.0", "3.1.1");
        i.installed = ExtensionKind::None;
        assert_refused(&i, UpgradeError::NotInstalled);

        let mut i = inputs("3.1.0", "3.1.1");
        i.target_legacy = true;
        assert_refused(&i, UpgradeError::MqttToAmqp);

        let i = inputs("3.1.1", "3.1.0");
        assert_refused(
            &i,
            UpgradeError::Downgrade {
                source: v("3.1.1"),
                target: v("3.1.0"),
            },
        );

        let mut i = inputs("3.0.4", "3.1.0");
        i.installed = ExtensionKind::Amqp;
        i.target_legacy = true;
        assert_refused(&i, UpgradeError::NonLegacyToLegacy { source: v("3.0.4") });
    }

    #[test]
    fn legacy_to_legacy_reinstalls_templates() {
        let mut i = inputs("3.0.4", "3.1.0");
        i.installed = ExtensionKind::Amqp;
        i.source_legacy = true;
        i.target_legacy = true;
        i.target_rde_version = None;
        i.source_rde_version = None;
        assert_eq!(
            plan_upgrade(&i).expect("plan"),
            vec![
                UpgradeStep::UpdateAmqpExtension,
                UpgradeStep::ReinstallTemplates,
                UpgradeStep::UpdateExtensionDescription,
            ]
        );
    }

    #[test]
    fn legacy_to_current_switches_extension_and_creates_entities() {
        let mut i = inputs("3.0.4", "3.1.0");
        i.installed = ExtensionKind::Amqp;
        i.source_legacy = true;
        i.source_rde_version = None;
        let steps = plan_upgrade(&i).expect("plan");
        assert_eq!(steps[0], UpgradeStep::SwitchAmqpToMqtt);
        assert!(steps.contains(&UpgradeStep::AssignPlacementPoliciesToClusters));
        assert!(steps.contains(&UpgradeStep::CreateEntitiesForLegacyClusters {
            version: "2.0.0".into()
        }));
        assert_eq!(steps.last(), Some(&UpgradeStep::UpdateExtensionDescription));
    }

    #[test]
    fn rde_bump_migrates_entities() {
        let steps = plan_upgrade(&inputs("3.1.0", "3.1.1")).expect("plan");
        assert!(steps.contains(&UpgradeStep::MigrateClusterEntities {
            from: "1.0.0".into(),
            to: "2.0.0".into(),
        }));
        assert!(steps.contains(&UpgradeStep::DeleteOrphanedEntityTypes {
            keep: "urn:vcloud:type:cse:nativeCluster:2.0.0".into()
        }));
    }

    #[test]
    fn description_without_rde_version_migrates_entities_of_its_api() {
        let source = ExtensionDescription::parse("CSE-3.0.3, vCD API version-35.0").expect("description");
        let mut i = inputs("3.0.3", "3.1.0");
        i.source_legacy = source.legacy_mode;
        i.source_rde_version = source.rde_version_in_use;

        let steps = plan_upgrade(&i).expect("plan");
        assert!(steps.contains(&UpgradeStep::MigrateClusterEntities {
            from: "1.0.0".into(),
            to: "2.0.0".into(),
        }));
        assert!(!steps
            .iter()
            .any(|s| matches!(s, UpgradeStep::CreateEntitiesForLegacyClusters { .. })));
    }
}
