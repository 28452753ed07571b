//! Optional PKS config file.

use std::collections::BTreeSet;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

use super::error::ConfigError;
use super::error::ConfigResult;

fn default_true() -> bool {
    true
}

fn default_pks_port() -> u16 {
    9021
}

fn default_uaac_port() -> u16 {
    8443
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PksConfig {
    pub pks_api_servers: Vec<PksApiServer>,
    pub pks_accounts: Vec<PksAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orgs: Vec<PksOrg>,
    pub pvdcs: Vec<PksPvdc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nsxt_servers: Vec<NsxtServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PksApiServer {
    pub name: String,
    pub host: String,
    #[serde(default = "default_pks_port")]
    pub port: u16,
    #[serde(default = "default_uaac_port")]
    pub uaac_port: u16,
    pub datacenter: String,
    pub clusters: Vec<String>,
    pub cpi: String,
    pub vc: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PksAccount {
    pub name: String,
    pub vc: String,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PksOrg {
    pub name: String,
    pub pks_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PksPvdc {
    pub name: String,
    pub pks_api_server: String,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NsxtServer {
    pub name: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub pks_api_server: String,
    pub nodes_ip_block: Vec<String>,
    pub pods_ip_block: Vec<String>,
    pub distributed_firewall_section_anchor_id: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl PksConfig {
    pub fn api_server(&self, name: &str) -> Option<&PksApiServer> {
        self.pks_api_servers.iter().find(|s| s.name == name)
    }

    pub fn nsxt_server_for(&self, pks_api_server: &str) -> Option<&NsxtServer> {
        self.nsxt_servers
            .iter()
            .find(|s| s.pks_api_server == pks_api_server)
    }

    /// Name uniqueness and cross references between sections.
    ///
    /// `vc_names` are the vCenters of the main config; PKS servers and
    /// accounts must point at one of them when it is non-empty.
    pub fn validate(&self, vc_names: &BTreeSet<String>) -> ConfigResult<()> {
        let servers = unique_names("pks_api_servers", self.pks_api_servers.iter().map(|s| &s.name))?;
        let accounts = unique_names("pks_accounts", self.pks_accounts.iter().map(|a| &a.name))?;
        unique_names("orgs", self.orgs.iter().map(|o| &o.name))?;
        unique_names("pvdcs", self.pvdcs.iter().map(|p| &p.name))?;
        unique_names("nsxt_servers", self.nsxt_servers.iter().map(|n| &n.name))?;

        let check_vc = |path: String, vc: &str| {
            if !vc_names.is_empty() && !vc_names.contains(vc) {
                return Err(Report::new(ConfigError::InvalidValue {
                    path,
                    message: format!("vCenter '{vc}' is not listed under 'vcs'"),
                }));
            }
            Ok(())
        };
        for (i, server) in self.pks_api_servers.iter().enumerate() {
            check_vc(format!("pks_api_servers.{i}.vc"), &server.vc)?;
        }
        for (i, account) in self.pks_accounts.iter().enumerate() {
            check_vc(format!("pks_accounts.{i}.vc"), &account.vc)?;
        }
        for (i, org) in self.orgs.iter().enumerate() {
            for account in &org.pks_accounts {
                if !accounts.contains(account.as_str()) {
                    return Err(unknown_reference(
                        format!("orgs.{i}.pks_accounts"),
                        "PKS account",
                        account,
                    ));
                }
            }
        }
        for (i, pvdc) in self.pvdcs.iter().enumerate() {
            if !servers.contains(pvdc.pks_api_server.as_str()) {
                return Err(unknown_reference(
                    format!("pvdcs.{i}.pks_api_server"),
                    "PKS API server",
                    &pvdc.pks_api_server,
                ));
            }
        }
        for (i, nsxt) in self.nsxt_servers.iter().enumerate() {
            if !servers.contains(nsxt.pks_api_server.as_str()) {
                return Err(unknown_reference(
                    format!("nsxt_servers.{i}.pks_api_server"),
                    "PKS API server",
                    &nsxt.pks_api_server,
                ));
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(
    section: &str,
    names: impl Iterator<Item = &'a String>,
) -> ConfigResult<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(Report::new(ConfigError::InvalidValue {
                path: section.to_string(),
                message: format!("duplicate name '{name}'"),
            }));
        }
    }
    Ok(seen)
}

fn unknown_reference(path: String, kind: &str, name: &str) -> Report<ConfigError> {
    Report::new(ConfigError::InvalidValue {
        path,
        message: format!("unknown {kind} '{name}'"),
    })
}
