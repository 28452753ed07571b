//! Runtime defined entity (RDE) registration for native clusters.
//!
//! Which RDE version CSE uses depends on the vCD API version: API 35.0
//! gets 1.0.0, API 36.0 and later get 2.0.0. Everything registered for a
//! version is described by a static metadata table.

use error_stack::Report;
use error_stack::ResultExt;
use futures::TryStreamExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use vcd_client::config::CLOUDAPI_V1;
use vcd_client::http_status;
use vcd_client::VcdClient;

use super::error::InstallError;
use super::error::InstallResult;

pub const RDE_VERSION_1: &str = "1.0.0";
pub const RDE_VERSION_2: &str = "2.0.0";
pub const NATIVE_ENTITY_VENDOR: &str = "cse";
pub const NATIVE_ENTITY_NSS: &str = "nativeCluster";
const FULL_CONTROL: &str = "urn:vcloud:accessLevel:FullControl";

/// RDE version matching a vCD API version; `None` below 35.0.
pub fn rde_version_for_api(api_version: f64) -> Option<&'static str> {
    if api_version >= 36.0 {
        Some(RDE_VERSION_2)
    } else if api_version >= 35.0 {
        Some(RDE_VERSION_1)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterfaceDef {
    pub vendor: &'static str,
    pub nss: &'static str,
    pub version: &'static str,
    pub name: &'static str,
}

impl InterfaceDef {
    pub fn id(&self) -> String {
        format!("urn:vcloud:interface:{}:{}:{}", self.vendor, self.nss, self.version)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EntityTypeDef {
    pub vendor: &'static str,
    pub nss: &'static str,
    pub version: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

impl EntityTypeDef {
    pub fn id(&self) -> String {
        entity_type_id(self.version)
    }
}

pub fn entity_type_id(version: &str) -> String {
    format!("urn:vcloud:type:{NATIVE_ENTITY_VENDOR}:{NATIVE_ENTITY_NSS}:{version}")
}

#[derive(Debug, Clone, Copy)]
pub struct BehaviorDef {
    pub name: &'static str,
    pub description: &'static str,
}

/// Everything registered for one RDE version.
#[derive(Debug, Clone, Copy)]
pub struct RdeMetadata {
    pub version: &'static str,
    pub interfaces: &'static [InterfaceDef],
    pub entity_type: EntityTypeDef,
    pub behaviors: &'static [BehaviorDef],
}

const K8S_INTERFACE: InterfaceDef = InterfaceDef {
    vendor: "vmware",
    nss: "k8s",
    version: "1.0.0",
    name: "Kubernetes",
};

const RDE_1: RdeMetadata = RdeMetadata {
    version: RDE_VERSION_1,
    interfaces: &[K8S_INTERFACE],
    entity_type: EntityTypeDef {
        vendor: NATIVE_ENTITY_VENDOR,
        nss: NATIVE_ENTITY_NSS,
        version: RDE_VERSION_1,
        name: "nativeClusterEntityType",
        description: "Native kubernetes cluster managed by CSE",
    },
    behaviors: &[],
};

const RDE_2: RdeMetadata = RdeMetadata {
    version: RDE_VERSION_2,
    interfaces: &[K8S_INTERFACE],
    entity_type: EntityTypeDef {
        vendor: NATIVE_ENTITY_VENDOR,
        nss: NATIVE_ENTITY_NSS,
        version: RDE_VERSION_2,
        name: "nativeClusterEntityType",
        description: "Native kubernetes cluster managed by CSE",
    },
    behaviors: &[
        BehaviorDef {
            name: "createCluster",
            description: "Deploys the cluster described by the entity",
        },
        BehaviorDef {
            name: "updateCluster",
            description: "Applies changes of the entity spec to the cluster",
        },
        BehaviorDef {
            name: "deleteCluster",
            description: "Deletes the cluster and its entity",
        },
    ],
};

pub fn metadata_for(version: &str) -> Option<&'static RdeMetadata> {
    [&RDE_1, &RDE_2].into_iter().find(|m| m.version == version)
}

/// Minimal schema of a native cluster entity. vCD only validates the
/// top level layout; the cluster controller owns the rest.
fn entity_schema(version: &str) -> Value {
    let api_version_key = if version == RDE_VERSION_1 { "api_version" } else { "apiVersion" };
    let mut properties = json!({
        "kind": {"type": "string"},
        "metadata": {"type": "object"},
        "spec": {"type": "object"},
        "status": {"type": "object"}
    });
    if let Some(map) = properties.as_object_mut() {
        map.insert(api_version_key.to_string(), json!({"type": "string"}));
    }
    json!({
        "type": "object",
        "required": ["kind", "metadata", "spec"],
        "properties": properties
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityType {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub nss: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct RdeRegistrar {
    client: VcdClient,
}

impl RdeRegistrar {
    pub fn new(client: VcdClient) -> Self {
        Self { client }
    }

    fn url(&self, path: &str) -> String {
        self.client.cloudapi_url(CLOUDAPI_V1, path)
    }

    async fn exists(&self, url: &str) -> InstallResult<bool> {
        match self.client.send(reqwest::Method::GET, url, None).await {
            Ok(_) => Ok(true),
            Err(e) if http_status(&e) == Some(404) => Ok(false),
            Err(e) => Err(e.change_context(InstallError::vcd(format!("read {url}")))),
        }
    }

    /// Registers interfaces, entity type, behaviours and their ACLs.
    /// Anything already present is left alone.
    pub async fn register(&self, version: &str) -> InstallResult<()> {
        let metadata = metadata_for(version).ok_or_else(|| {
            Report::new(InstallError::Rde {
                message: format!("unknown RDE version {version}"),
            })
        })?;

        for interface in metadata.interfaces {
            let id = interface.id();
            if self.exists(&self.url(&format!("interfaces/{id}"))).await? {
                debug!(%id, "Interface already registered");
                continue;
            }
            self.client
                .post(
                    &self.url("interfaces"),
                    &json!({
                        "name": interface.name,
                        "vendor": interface.vendor,
                        "nss": interface.nss,
                        "version": interface.version,
                        "readonly": false
                    }),
                )
                .await
                .change_context(InstallError::vcd(format!("register interface {id}")))?;
            info!(%id, "Registered interface");
        }

        let entity_type = &metadata.entity_type;
        let type_id = entity_type.id();
        if self.exists(&self.url(&format!("entityTypes/{type_id}"))).await? {
            debug!(%type_id, "Entity type already registered");
        } else {
            self.client
                .post(
                    &self.url("entityTypes"),
                    &json!({
                        "name": entity_type.name,
                        "description": entity_type.description,
                        "vendor": entity_type.vendor,
                        "nss": entity_type.nss,
                        "version": entity_type.version,
                        "interfaces": metadata.interfaces.iter().map(InterfaceDef::id).collect::<Vec<_>>(),
                        "schema": entity_schema(version),
                        "readonly": false
                    }),
                )
                .await
                .change_context(InstallError::vcd(format!("register entity type {type_id}")))?;
            info!(%type_id, "Registered entity type");
        }

        for behavior in metadata.behaviors {
            let behavior_id = format!("{type_id}:{}", behavior.name);
            let behaviors_url = self.url(&format!("entityTypes/{type_id}/behaviors"));
            if self.exists(&format!("{behaviors_url}/{behavior_id}")).await? {
                continue;
            }
            self.client
                .post(
                    &behaviors_url,
                    &json!({
                        "name": behavior.name,
                        "description": behavior.description,
                        "execution": {"type": "noop", "id": behavior.name}
                    }),
                )
                .await
                .change_context(InstallError::vcd(format!("register behavior {}", behavior.name)))?;
            self.client
                .post(
                    &self.url(&format!("entityTypes/{type_id}/behaviorAccessControls")),
                    &json!({"behaviorId": behavior_id, "accessLevelId": FULL_CONTROL}),
                )
                .await
                .change_context(InstallError::vcd(format!("grant access to behavior {}", behavior.name)))?;
            info!(behavior = behavior.name, "Registered behavior");
        }
        Ok(())
    }

    /// Whether the entity type of `version` exists.
    pub async fn is_registered(&self, version: &str) -> InstallResult<bool> {
        let type_id = entity_type_id(version);
        self.exists(&self.url(&format!("entityTypes/{type_id}"))).await
    }

    /// Native cluster entity types other than `keep`.
    pub async fn other_native_entity_types(&self, keep: &str) -> InstallResult<Vec<EntityType>> {
        let filter = vcd_client::construct_filter_string(&[
            ("vendor", NATIVE_ENTITY_VENDOR),
            ("nss", NATIVE_ENTITY_NSS),
        ]);
        let types: Vec<EntityType> = self
            .client
            .paginate::<EntityType>(self.url("entityTypes"), vec![("filter".to_string(), filter)])
            .try_collect()
            .await
            .change_context(InstallError::vcd("list entity types"))?;
        Ok(types.into_iter().filter(|t| t.id != keep).collect())
    }

    /// Deletes native entity types whose id differs from `keep`. Only
    /// call once their entities were migrated.
    pub async fn delete_orphaned_entity_types(&self, keep: &str) -> InstallResult<Vec<String>> {
        let mut deleted = Vec::new();
        for entity_type in self.other_native_entity_types(keep).await? {
            self.client
                .delete(&self.url(&format!("entityTypes/{}", entity_type.id)))
                .await
                .change_context(InstallError::vcd(format!(
                    "delete entity type {}",
                    entity_type.id
                )))?;
            info!(id = %entity_type.id, "Deleted orphaned entity type");
            deleted.push(entity_type.id);
        }
        Ok(deleted)
    }
}

fn take(map: &mut Map<String, Value>, key: &str) -> Value {
    map.remove(key).unwrap_or(Value::Null)
}

fn rename_keys(value: Value, renames: &[(&str, &str)]) -> Value {
    match value {
        Value::Object(mut map) => {
            for (from, to) in renames {
                if let Some(v) = map.remove(*from) {
                    map.insert(to.to_string(), v);
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn drop_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, drop_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Converts a 1.0.0 native cluster document to the 2.0.0 layout.
///
/// Fields are renamed to camel case and regrouped; values are carried
/// over untouched and unknown fields are dropped.
pub fn migrate_entity_1_to_2(entity: &Value) -> Value {
    let mut old = entity.as_object().cloned().unwrap_or_default();
    let mut metadata = take(&mut old, "metadata").as_object().cloned().unwrap_or_default();
    let mut spec = take(&mut old, "spec").as_object().cloned().unwrap_or_default();
    let status = take(&mut old, "status");

    let node_renames = [
        ("sizing_class", "sizingClass"),
        ("storage_profile", "storageProfile"),
    ];
    let workers = rename_keys(take(&mut spec, "workers"), &node_renames);
    let control_plane = rename_keys(take(&mut spec, "control_plane"), &node_renames);
    let nfs = rename_keys(take(&mut spec, "nfs"), &node_renames);
    let distribution = rename_keys(
        take(&mut spec, "k8_distribution"),
        &[("template_name", "templateName"), ("template_revision", "templateRevision")],
    );
    let settings = rename_keys(
        take(&mut spec, "settings"),
        &[
            ("network", "ovdcNetwork"),
            ("ssh_key", "sshKey"),
            ("rollback_on_failure", "rollbackOnFailure"),
        ],
    );
    let status = rename_keys(
        status,
        &[
            ("docker_version", "dockerVersion"),
            ("task_href", "taskHref"),
        ],
    );

    drop_nulls(json!({
        "apiVersion": "cse.vmware.com/v2.0",
        "kind": take(&mut old, "kind"),
        "metadata": {
            "name": take(&mut metadata, "cluster_name"),
            "orgName": take(&mut metadata, "org_name"),
            "virtualDataCenterName": take(&mut metadata, "ovdc_name"),
            "site": take(&mut metadata, "site"),
        },
        "spec": {
            "topology": {
                "controlPlane": control_plane,
                "workers": workers,
                "nfs": nfs,
            },
            "distribution": distribution,
            "settings": settings,
        },
        "status": status,
    }))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn rde_version_follows_api_version() {
        assert_eq!(rde_version_for_api(34.0), None);
        assert_eq!(rde_version_for_api(35.0), Some(RDE_VERSION_1));
        assert_eq!(rde_version_for_api(36.0), Some(RDE_VERSION_2));
        assert_eq!(rde_version_for_api(37.0), Some(RDE_VERSION_2));
    }

    #[test]
    fn metadata_table_ids() {
        let m = metadata_for(RDE_VERSION_2).expect("known version");
        assert_eq!(m.entity_type.id(), "urn:vcloud:type:cse:nativeCluster:2.0.0");
        assert_eq!(m.interfaces[0].id(), "urn:vcloud:interface:vmware:k8s:1.0.0");
        assert!(metadata_for(RDE_VERSION_1).expect("known").behaviors.is_empty());
        assert!(metadata_for("9.9.9").is_none());
    }

    #[test]
    fn entity_migrates_to_v2_layout() {
        let v1 = json!({
            "kind": "native",
            "api_version": "",
            "metadata": {"cluster_name": "c1", "org_name": "org", "ovdc_name": "vdc"},
            "spec": {
                "workers": {"count": 2, "sizing_class": "small", "storage_profile": "*"},
                "control_plane": {"count": 1, "sizing_class": null},
                "k8_distribution": {"template_name": "ubuntu-k8", "template_revision": 1},
                "settings": {"network": "net", "ssh_key": null, "rollback_on_failure": true}
            },
            "status": {"phase": "CREATE:SUCCEEDED", "docker_version": "19.03"}
        });
        let v2 = migrate_entity_1_to_2(&v1);
        assert_eq!(
            v2,
            json!({
                "apiVersion": "cse.vmware.com/v2.0",
                "kind": "native",
                "metadata": {"name": "c1", "orgName": "org", "virtualDataCenterName": "vdc"},
                "spec": {
                    "topology": {
                        "controlPlane": {"count": 1},
                        "workers": {"count": 2, "sizingClass": "small", "storageProfile": "*"}
                    },
                    "distribution": {"templateName": "ubuntu-k8", "templateRevision": 1},
                    "settings": {"ovdcNetwork": "net", "rollbackOnFailure": true}
                },
                "status": {"phase": "CREATE:SUCCEEDED", "dockerVersion": "19.03"}
            })
        );
    }
}
