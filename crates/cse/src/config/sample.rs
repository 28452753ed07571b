//! Sample config files printed by `cse sample`.

const VCD_SECTION: &str = r#"# vCloud Director connection
vcd:
  host: vcd.example.com
  port: 443
  username: administrator
  password: my_secret_password
  api_version: '36.0'
  verify: true
  log: false

vcs:
  - name: vc1
    username: cse_user@vsphere.local
    password: my_secret_password
    verify: true
"#;

const BROKER_SECTION: &str = r#"
broker:
  catalog: cse
  default_template_name: ubuntu-20.04_k8-1.21_weave-2.8.1
  default_template_revision: 1
  ip_allocation_mode: pool
  network: mynetwork
  org: myorg
  remote_template_cookbook_url: https://raw.githubusercontent.com/vmware/container-service-extension-templates/master/template_v2.yaml
  storage_profile: '*'
  vdc: myorgvdc
"#;

const AMQP_SECTION: &str = r#"
amqp:
  host: amqp.example.com
  port: 5672
  prefix: vcd
  username: guest
  password: guest
  exchange: cse-ext
  routing_key: cse
  ssl: false
  ssl_accept_all: false
  vhost: /
"#;

const MQTT_SECTION: &str = r#"
mqtt:
  verify_ssl: true
"#;

fn service_section(legacy: bool) -> String {
    format!(
        r#"
service:
  processors: 15
  enforce_authorization: false
  log_wire: false
  legacy_mode: {legacy}
  telemetry:
    enable: true
"#
    )
}

/// Sample CSE config. Legacy installs talk AMQP, current ones MQTT.
pub fn sample_config(legacy: bool) -> String {
    let mut text = String::from(VCD_SECTION);
    text.push_str(&service_section(legacy));
    text.push_str(BROKER_SECTION);
    text.push_str(if legacy { AMQP_SECTION } else { MQTT_SECTION });
    text
}

pub fn sample_pks_config() -> String {
    r#"# Enterprise PKS integration
pks_api_servers:
  - name: pks-api-server-1
    host: pks.example.com
    port: 9021
    uaac_port: 8443
    datacenter: pks-s1-dc
    clusters:
      - pks-s1-az-1
      - pks-s1-az-2
    cpi: cpi1
    vc: vc1
    verify: true

pks_accounts:
  - name: org1-service-account
    vc: vc1
    username: org1Admin
    secret: long-secret

orgs:
  - name: org1
    pks_accounts:
      - org1-service-account

pvdcs:
  - name: pvdc1
    pks_api_server: pks-api-server-1
    cluster: pks-s1-az-1

nsxt_servers:
  - name: nsxt-server-1
    host: nsxt.example.com
    username: admin
    password: my_secret_password
    pks_api_server: pks-api-server-1
    nodes_ip_block:
      - nodes-ip-block-1
    pods_ip_block:
      - pods-ip-block-1
    distributed_firewall_section_anchor_id: id
    verify: true
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::pks::PksConfig;
    use crate::config::schema::CseConfig;
    use crate::config::validate::check_config_keys;
    use crate::config::validate::validate_values;

    #[test]
    fn samples_pass_validation() {
        for legacy in [false, true] {
            let text = sample_config(legacy);
            let raw: serde_yaml::Value = serde_yaml::from_str(&text).expect("yaml");
            check_config_keys(&raw).expect("keys");
            let config: CseConfig = serde_yaml::from_str(&text).expect("typed");
            validate_values(&config).expect("values");
            assert_eq!(config.legacy_mode(), legacy);
            assert_eq!(config.amqp.is_some(), legacy);
            assert_eq!(config.mqtt.is_some(), !legacy);
        }
    }

    #[test]
    fn pks_sample_is_consistent() {
        let config: PksConfig = serde_yaml::from_str(&sample_pks_config()).expect("typed");
        config
            .validate(&["vc1".to_string()].into())
            .expect("consistent");
    }
}
