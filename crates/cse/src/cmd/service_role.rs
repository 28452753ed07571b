use anyhow::Result;
use tracing::info;
use vcd_client::ClientConfig;
use vcd_client::Credentials;
use vcd_client::VcdClient;

use super::IntoAnyhow;
use crate::config::cli::ServiceRoleArgs;
use crate::install::rights;

pub async fn run_create_service_role(args: ServiceRoleArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => super::prompt::read_hidden(&format!("Password for {}: ", args.username))?,
    };
    let config = ClientConfig::new(args.vcd_host.clone())
        .with_api_version(args.api_version)
        .with_verify_ssl(args.verify);
    let client = VcdClient::login(config, &Credentials::system(args.username, password))
        .await
        .into_anyhow()?;

    let result = rights::create_service_role(&client).await.into_anyhow();
    super::logout(&client).await;
    result?;
    info!(host = %args.vcd_host, role = rights::SERVICE_ROLE_NAME, "Service role ready");
    println!("Created role '{}'", rights::SERVICE_ROLE_NAME);
    Ok(())
}
