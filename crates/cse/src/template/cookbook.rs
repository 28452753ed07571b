//! Remote template cookbook.
//!
//! The cookbook is a YAML document listing every template CSE can build,
//! with the OVA to start from. Customization scripts live next to it under
//! `scripts/<name>_rev<revision>/cust.sh`.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use semver::Version;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::info;
use url::Url;

use super::error::TemplateError;
use super::error::TemplateResult;
use super::metadata::TemplateMetadata;
use crate::compute_policy::K8sRuntime;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const CUSTOMIZATION_SCRIPT: &str = "cust.sh";

/// Template entry of the cookbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTemplate {
    #[serde(flatten)]
    pub metadata: TemplateMetadata,
    pub source_ova: String,
    pub source_ova_name: String,
    #[serde(default)]
    pub sha256_ova: String,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// MB
    #[serde(default = "default_mem")]
    pub mem: u32,
}

fn default_cpu() -> u32 {
    2
}

fn default_mem() -> u32 {
    2048
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cookbook {
    #[serde(default)]
    pub templates: Vec<RemoteTemplate>,
}

impl Cookbook {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn find(&self, name: &str, revision: u32) -> TemplateResult<&RemoteTemplate> {
        self.templates
            .iter()
            .find(|t| t.metadata.name == name && t.metadata.revision == revision)
            .ok_or_else(|| {
                Report::new(TemplateError::UnknownTemplate {
                    name: name.to_string(),
                    revision,
                })
            })
    }
}

/// `3.1` is read as `3.1.0`.
pub fn parse_version_lenient(text: &str) -> Option<Version> {
    let text = text.trim().trim_start_matches('v');
    Version::parse(text).ok().or_else(|| {
        let padded = match text.matches('.').count() {
            0 => format!("{text}.0.0"),
            1 => format!("{text}.0"),
            _ => return None,
        };
        Version::parse(&padded).ok()
    })
}

/// Whether this CSE release may install `template`.
///
/// Templates outside their `[min_cse_version, max_cse_version]` window are
/// dropped, and TKGm templates need a non-legacy installation.
pub fn is_supported(template: &TemplateMetadata, cse_version: &Version, legacy_mode: bool) -> bool {
    let min = template.min_cse_version.trim();
    let max = template.max_cse_version.trim();
    let above_min = min.is_empty() || parse_version_lenient(min).is_some_and(|min| *cse_version >= min);
    let below_max = max.is_empty() || parse_version_lenient(max).is_some_and(|max| *cse_version <= max);
    above_min && below_max && !(legacy_mode && template.runtime() == Some(K8sRuntime::Tkgm))
}

pub fn filter_templates(
    templates: Vec<RemoteTemplate>,
    cse_version: &Version,
    legacy_mode: bool,
) -> Vec<RemoteTemplate> {
    templates
        .into_iter()
        .filter(|t| is_supported(&t.metadata, cse_version, legacy_mode))
        .collect()
}

/// Fetches cookbooks and customization scripts.
#[derive(Debug, Clone)]
pub struct CookbookClient {
    http: reqwest::Client,
    url: Url,
}

impl CookbookClient {
    pub fn new(url: &str) -> TemplateResult<Self> {
        let invalid = || TemplateError::Cookbook {
            url: url.to_string(),
        };
        let url = Url::parse(url).change_context_lazy(invalid)?;
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .change_context_lazy(invalid)?;
        Ok(Self { http, url })
    }

    async fn fetch_text(&self, url: &Url) -> TemplateResult<String> {
        let error = || TemplateError::Cookbook {
            url: url.to_string(),
        };
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .change_context_lazy(error)?
            .error_for_status()
            .change_context_lazy(error)?;
        response.text().await.change_context_lazy(error)
    }

    /// The cookbook as published, supported or not.
    pub async fn fetch_all(&self) -> TemplateResult<Cookbook> {
        let text = self.fetch_text(&self.url).await?;
        Cookbook::parse(&text).change_context(TemplateError::Cookbook {
            url: self.url.to_string(),
        })
    }

    /// Every template of the cookbook this release supports.
    pub async fn fetch(&self, cse_version: &Version, legacy_mode: bool) -> TemplateResult<Cookbook> {
        let cookbook = self.fetch_all().await?;
        let total = cookbook.templates.len();
        let templates = filter_templates(cookbook.templates, cse_version, legacy_mode);
        info!(url = %self.url, total, supported = templates.len(), "Fetched template cookbook");
        Ok(Cookbook { templates })
    }

    pub fn script_url(&self, template: &TemplateMetadata) -> TemplateResult<Url> {
        self.url
            .join(&format!(
                "scripts/{}/{CUSTOMIZATION_SCRIPT}",
                template.catalog_item_name()
            ))
            .change_context(TemplateError::Cookbook {
                url: self.url.to_string(),
            })
    }

    pub async fn customization_script(&self, template: &TemplateMetadata) -> TemplateResult<String> {
        let url = self.script_url(template)?;
        debug!(%url, "Fetching customization script");
        self.fetch_text(&url).await
    }

    /// Streams the source OVA of `template` to `dest`.
    pub async fn download_ova(&self, template: &RemoteTemplate, dest: &Path) -> TemplateResult<()> {
        let error = || TemplateError::Cookbook {
            url: template.source_ova.clone(),
        };
        let io_error = || TemplateError::Io {
            path: dest.display().to_string(),
        };
        let response = reqwest::Client::new()
            .get(&template.source_ova)
            .send()
            .await
            .change_context_lazy(error)?
            .error_for_status()
            .change_context_lazy(error)?;
        let mut file = tokio::fs::File::create(dest).await.change_context_lazy(io_error)?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.change_context_lazy(error)?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await.change_context_lazy(io_error)?;
        }
        file.flush().await.change_context_lazy(io_error)?;
        info!(ova = %template.source_ova_name, bytes = written, "Downloaded source OVA");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    const COOKBOOK: &str = r#"
templates:
- name: ubuntu-16.04_k8-1.18_weave-2.6.5
  revision: 2
  kind: native
  min_cse_version: 3.0.0
  max_cse_version: 3.1.0
  source_ova: https://example.com/ubuntu.ova
  source_ova_name: ubuntu.ova
  sha256_ova: abc
- name: ubuntu-20.04_tkgm-1.20_antrea-0.11
  revision: 1
  kind: TKGm
  min_cse_version: "3.1"
  max_cse_version: 3.9.9
  source_ova: https://example.com/tkgm.ova
  source_ova_name: tkgm.ova
- name: photon-v2_k8-1.12_weave-2.3.0
  revision: 4
  kind: native
  min_cse_version: 2.0.0
  max_cse_version: 2.6.0
  source_ova: https://example.com/photon.ova
  source_ova_name: photon.ova
"#;

    fn names(templates: &[RemoteTemplate]) -> Vec<&str> {
        templates.iter().map(|t| t.metadata.name.as_str()).collect()
    }

    #[test]
    fn lenient_versions() {
        assert_eq!(parse_version_lenient("3.1"), Some(Version::new(3, 1, 0)));
        assert_eq!(parse_version_lenient("v3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version_lenient("3.1.2"), Some(Version::new(3, 1, 2)));
        assert_eq!(parse_version_lenient("three"), None);
    }

    #[test]
    fn templates_are_filtered_by_version_and_mode() {
        let cookbook = Cookbook::parse(COOKBOOK).expect("cookbook");
        assert_eq!(cookbook.templates[0].cpu, 2);

        let current = filter_templates(cookbook.templates.clone(), &Version::new(3, 1, 0), false);
        assert_eq!(
            names(&current),
            vec!["ubuntu-16.04_k8-1.18_weave-2.6.5", "ubuntu-20.04_tkgm-1.20_antrea-0.11"]
        );

        let legacy = filter_templates(cookbook.templates.clone(), &Version::new(3, 1, 0), true);
        assert_eq!(names(&legacy), vec!["ubuntu-16.04_k8-1.18_weave-2.6.5"]);

        let newer = filter_templates(cookbook.templates, &Version::new(3, 2, 0), false);
        assert_eq!(names(&newer), vec!["ubuntu-20.04_tkgm-1.20_antrea-0.11"]);
    }

    #[test(tokio::test)]
    async fn fetch_and_script_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cookbook/template.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(COOKBOOK))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cookbook/scripts/photon-v2_k8-1.12_weave-2.3.0_rev4/cust.sh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/bash\n"))
            .mount(&server)
            .await;

        let client = CookbookClient::new(&format!("{}/cookbook/template.yaml", server.uri()))
            .expect("client");
        let cookbook = client.fetch(&Version::new(2, 5, 0), true).await.expect("fetch");
        assert_eq!(names(&cookbook.templates), vec!["photon-v2_k8-1.12_weave-2.3.0"]);

        let template = cookbook.find("photon-v2_k8-1.12_weave-2.3.0", 4).expect("find");
        let script = client
            .customization_script(&template.metadata)
            .await
            .expect("script");
        assert_eq!(script, "#!/bin/bash\n");

        let err = cookbook.find("photon-v2_k8-1.12_weave-2.3.0", 1).expect_err("revision");
        assert!(matches!(err.current_context(), TemplateError::UnknownTemplate { .. }));
    }

    #[test(tokio::test)]
    async fn unreachable_cookbook_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = CookbookClient::new(&format!("{}/template.yaml", server.uri())).expect("client");
        let err = client
            .fetch(&Version::new(3, 1, 0), false)
            .await
            .expect_err("404");
        assert!(matches!(err.current_context(), TemplateError::Cookbook { .. }));
    }
}
