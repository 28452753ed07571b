//! Rights CSE needs, and the service role holding them.

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing::info;
use vcd_client::config::CLOUDAPI_V1;
use vcd_client::construct_filter_string;
use vcd_client::VcdClient;

use super::error::InstallError;
use super::error::InstallResult;
use super::rde;

pub const SERVICE_ROLE_NAME: &str = "CSE Service Role";
const SERVICE_ROLE_DESCRIPTION: &str = "Rights needed by the CSE server's vCD account";

/// Rights held by the CSE service role.
pub const SERVICE_ROLE_RIGHTS: &[&str] = &[
    "Access All Organization VDCs",
    "Catalog: Add vApp from My Cloud",
    "Catalog: View Private and Shared Catalogs",
    "Catalog: View Published Catalogs",
    "Extension: View",
    "Organization vDC Compute Policy: Admin View",
    "Organization vDC Compute Policy: Manage",
    "Organization vDC Compute Policy: View",
    "Organization vDC: Manage",
    "Organization vDC: View",
    "Organization: View",
    "Provider vDC Compute Policy: Manage",
    "Provider vDC Compute Policy: View",
    "Provider vDC: View",
    "Task: Resume, Abort, or Fail",
    "Task: Update",
    "Token: Manage",
    "vApp: Change Compute Policy",
    "vApp: Create / Reconfigure a vApp",
    "vApp: Delete",
    "vApp: Edit Properties",
    "vApp: View VM metrics",
];

/// Rights vCD generates for an entity type.
pub fn entity_type_rights() -> Vec<String> {
    let prefix = format!("{}:{}", rde::NATIVE_ENTITY_VENDOR, rde::NATIVE_ENTITY_NSS);
    ["View", "Full Access", "Administrator View", "Administrator Full access"]
        .iter()
        .map(|level| format!("{prefix}: {level}"))
        .collect()
}

/// Extension rights registered by legacy installs.
pub const LEGACY_RIGHTS: &[(&str, &str)] = &[
    ("CSE NATIVE DEPLOY RIGHT", "Deploy native kubernetes clusters"),
    ("PKS DEPLOY RIGHT", "Deploy PKS kubernetes clusters"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightReference {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Role {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RightsBundle {
    id: String,
}

fn url(client: &VcdClient, path: &str) -> String {
    client.cloudapi_url(CLOUDAPI_V1, path)
}

/// Looks a right up by its exact name.
pub async fn find_right(client: &VcdClient, name: &str) -> InstallResult<RightReference> {
    client
        .paginate::<RightReference>(
            url(client, "rights"),
            vec![("filter".to_string(), construct_filter_string(&[("name", name)]))],
        )
        .try_filter(|r| futures::future::ready(r.name == name))
        .boxed()
        .try_next()
        .await
        .change_context(InstallError::vcd(format!("look up right '{name}'")))?
        .ok_or_else(|| Report::new(InstallError::vcd(format!("right '{name}' does not exist"))))
}

/// Creates the service role in the System org, or tops up its rights.
pub async fn create_service_role(client: &VcdClient) -> InstallResult<()> {
    let existing = client
        .paginate::<Role>(
            url(client, "roles"),
            vec![(
                "filter".to_string(),
                construct_filter_string(&[("name", SERVICE_ROLE_NAME)]),
            )],
        )
        .boxed()
        .try_next()
        .await
        .change_context(InstallError::vcd("look up service role"))?;

    let role = match existing {
        Some(role) => {
            debug!(id = %role.id, "Service role exists");
            role
        }
        None => client
            .post_json::<_, Role>(
                &url(client, "roles"),
                &json!({"name": SERVICE_ROLE_NAME, "description": SERVICE_ROLE_DESCRIPTION}),
            )
            .await
            .change_context(InstallError::vcd("create service role"))?,
    };

    let mut rights = Vec::with_capacity(SERVICE_ROLE_RIGHTS.len());
    for name in SERVICE_ROLE_RIGHTS {
        rights.push(find_right(client, name).await?);
    }
    client
        .put(
            &url(client, &format!("roles/{}/rights", role.id)),
            &json!({"values": rights}),
        )
        .await
        .change_context(InstallError::vcd("assign rights to service role"))?;
    info!(role = SERVICE_ROLE_NAME, rights = rights.len(), "Service role is ready");
    Ok(())
}

/// Adds the entity type rights to the bundle vCD created for the type and
/// publishes it to every tenant.
pub async fn register_entity_rights(client: &VcdClient) -> InstallResult<()> {
    let bundle_name = format!("{}:{} Entitlement", rde::NATIVE_ENTITY_VENDOR, rde::NATIVE_ENTITY_NSS);
    let bundle = client
        .paginate::<RightsBundle>(
            url(client, "rightsBundles"),
            vec![(
                "filter".to_string(),
                construct_filter_string(&[("name", bundle_name.as_str())]),
            )],
        )
        .boxed()
        .try_next()
        .await
        .change_context(InstallError::vcd("look up rights bundle"))?
        .ok_or_else(|| Report::new(InstallError::vcd(format!("rights bundle '{bundle_name}' not found"))))?;

    let mut rights = Vec::new();
    for name in entity_type_rights() {
        rights.push(find_right(client, &name).await?);
    }
    client
        .post(
            &url(client, &format!("rightsBundles/{}/rights", bundle.id)),
            &json!({"values": rights}),
        )
        .await
        .change_context(InstallError::vcd("add rights to bundle"))?;
    client
        .post(
            &url(client, &format!("rightsBundles/{}/tenants/publishAll", bundle.id)),
            &json!({}),
        )
        .await
        .change_context(InstallError::vcd("publish rights bundle"))?;
    info!(bundle = %bundle_name, "Published cluster rights");
    Ok(())
}

/// Registers the legacy extension rights on an AMQP extension.
pub async fn register_legacy_rights(client: &VcdClient, extension_href: &str) -> InstallResult<()> {
    for (name, description) in LEGACY_RIGHTS {
        let result = client
            .post(
                &format!("{extension_href}/rights"),
                &json!({"name": name, "description": description, "bundleKey": name}),
            )
            .await;
        match result {
            Ok(_) => info!(right = name, "Registered right"),
            Err(e) if vcd_client::http_status(&e) == Some(400) => {
                debug!(right = name, "Right already registered")
            }
            Err(e) => return Err(e.change_context(InstallError::vcd(format!("register right {name}")))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn entity_rights_are_named_after_the_type() {
        assert_eq!(
            entity_type_rights(),
            vec![
                "cse:nativeCluster: View",
                "cse:nativeCluster: Full Access",
                "cse:nativeCluster: Administrator View",
                "cse:nativeCluster: Administrator Full access",
            ]
        );
    }

    #[test(tokio::test)]
    async fn missing_right_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/1.0.0/rights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
            .mount(&server)
            .await;
        let client = VcdClient::new(ClientConfig::new(server.uri()))
            .expect("client")
            .with_token("t");
        let err = find_right(&client, "Token: Manage").await.expect_err("missing");
        assert!(matches!(err.current_context(), InstallError::Vcd { .. }));
    }

    #[test(tokio::test)]
    async fn existing_role_gets_rights() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/1.0.0/roles"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [{"id": "urn:vcloud:role:1", "name": SERVICE_ROLE_NAME}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cloudapi/1.0.0/rights"))
            .and(query_param("page", "1"))
            .respond_with(|req: &wiremock::Request| {
                let filter = req
                    .url
                    .query_pairs()
                    .find(|(k, _)| k == "filter")
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default();
                let name = filter.trim_start_matches("name==").replace("\\", "");
                ResponseTemplate::new(200).set_body_json(json!({
                    "values": [{"name": name, "id": format!("urn:vcloud:right:{}", name.len())}]
                }))
            })
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/cloudapi/1.0.0/roles/urn:vcloud:role:1/rights"))
            .and(body_partial_json(json!({"values": [{"name": "Access All Organization VDCs"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = VcdClient::new(ClientConfig::new(server.uri()))
            .expect("client")
            .with_token("t");
        create_service_role(&client).await.expect("role");
    }
}
