//! Request URI to operation mapping.
//!
//! Paths look like `/api/cse[/<version>]/<resource>[/<id>[/<sub>]]`; only
//! exact segment counts match.

use error_stack::Report;

use super::errors::RequestError;
use super::errors::RequestResult;

const CSE_PATH_PREFIX: &[&str] = &["api", "cse"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    SystemInfo,
    SystemUpdate,
    TemplateList,
    OvdcList,
    OvdcInfo { ovdc_id: String },
    OvdcUpdate { ovdc_id: String },
    OvdcComputePolicyList { ovdc_id: String },
    OvdcComputePolicyUpdate { ovdc_id: String },
    ClusterList,
    ClusterCreate,
    ClusterInfo { cluster_id: String },
    ClusterResize { cluster_id: String },
    ClusterDelete { cluster_id: String },
    ClusterConfig { cluster_id: String },
    NodeCreate,
    NodeInfo { node_name: String },
    NodeDelete,
}

impl Operation {
    /// Operations still served while the service is disabled.
    pub fn allowed_when_disabled(&self) -> bool {
        matches!(self, Self::SystemInfo | Self::SystemUpdate)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemInfo => "system info",
            Self::SystemUpdate => "system update",
            Self::TemplateList => "template list",
            Self::OvdcList => "ovdc list",
            Self::OvdcInfo { .. } => "ovdc info",
            Self::OvdcUpdate { .. } => "ovdc update",
            Self::OvdcComputePolicyList { .. } => "ovdc compute policy list",
            Self::OvdcComputePolicyUpdate { .. } => "ovdc compute policy update",
            Self::ClusterList => "cluster list",
            Self::ClusterCreate => "cluster create",
            Self::ClusterInfo { .. } => "cluster info",
            Self::ClusterResize { .. } => "cluster resize",
            Self::ClusterDelete { .. } => "cluster delete",
            Self::ClusterConfig { .. } => "cluster config",
            Self::NodeCreate => "node create",
            Self::NodeInfo { .. } => "node info",
            Self::NodeDelete => "node delete",
        }
    }
}

fn is_version_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Resource segments after `/api/cse` and an optional version, or `None`
/// for paths outside CSE.
fn resource_segments(request_uri: &str) -> Option<Vec<&str>> {
    let path = request_uri.split(['?', '#']).next().unwrap_or_default();
    // absolute URIs carry scheme and host in front of the path
    let path = match path.find("://") {
        Some(i) => path[i + 3..].find('/').map_or("", |j| &path[i + 3 + j..]),
        None => path,
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let start = segments
        .windows(CSE_PATH_PREFIX.len())
        .position(|w| w == CSE_PATH_PREFIX)?;
    let mut rest = &segments[start + CSE_PATH_PREFIX.len()..];
    if rest.first().is_some_and(|s| is_version_segment(s)) {
        rest = &rest[1..];
    }
    Some(rest.to_vec())
}

/// Matches method and URI against the supported operations.
pub fn route(method: &str, request_uri: &str) -> RequestResult<Operation> {
    let not_found = || {
        Report::new(RequestError::NotFound {
            resource: format!("Path {request_uri}"),
        })
    };
    let segments = resource_segments(request_uri).ok_or_else(not_found)?;
    let method = method.to_ascii_uppercase();
    let id = |i: usize| segments[i].to_string();

    let operation = match (segments.as_slice(), method.as_str()) {
        (["system"], "GET") => Operation::SystemInfo,
        (["system"], "PUT") => Operation::SystemUpdate,
        (["templates"], "GET") => Operation::TemplateList,
        (["ovdcs"], "GET") => Operation::OvdcList,
        (["ovdc", _], "GET") => Operation::OvdcInfo { ovdc_id: id(1) },
        (["ovdc", _], "PUT") => Operation::OvdcUpdate { ovdc_id: id(1) },
        (["ovdc", _, "compute-policies"], "GET") => Operation::OvdcComputePolicyList { ovdc_id: id(1) },
        (["ovdc", _, "compute-policies"], "PUT") => Operation::OvdcComputePolicyUpdate { ovdc_id: id(1) },
        (["clusters"], "GET") => Operation::ClusterList,
        (["clusters"], "POST") => Operation::ClusterCreate,
        (["cluster", _], "GET") => Operation::ClusterInfo { cluster_id: id(1) },
        (["cluster", _], "PUT") => Operation::ClusterResize { cluster_id: id(1) },
        (["cluster", _], "DELETE") => Operation::ClusterDelete { cluster_id: id(1) },
        (["cluster", _, "config"], "GET") => Operation::ClusterConfig { cluster_id: id(1) },
        (["nodes"], "POST") => Operation::NodeCreate,
        (["nodes"], "DELETE") => Operation::NodeDelete,
        (["node", _], "GET") => Operation::NodeInfo { node_name: id(1) },
        (
            ["system"]
            | ["templates"]
            | ["ovdcs"]
            | ["ovdc", _]
            | ["ovdc", _, "compute-policies"]
            | ["clusters"]
            | ["cluster", _]
            | ["cluster", _, "config"]
            | ["nodes"]
            | ["node", _],
            _,
        ) => {
            return Err(Report::new(RequestError::MethodNotAllowed {
                method,
                path: request_uri.to_string(),
            }))
        }
        _ => return Err(not_found()),
    };
    Ok(operation)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn status(result: RequestResult<Operation>) -> u16 {
        result.expect_err("error").current_context().status_code()
    }

    #[test]
    fn exact_segments_match() {
        assert_eq!(route("GET", "/api/cse/system").expect("route"), Operation::SystemInfo);
        assert_eq!(
            route("get", "/api/cse/3.0/ovdc/abc").expect("route"),
            Operation::OvdcInfo { ovdc_id: "abc".into() }
        );
        assert_eq!(
            route("PUT", "https://vcd.local/api/cse/ovdc/abc/compute-policies?x=1").expect("route"),
            Operation::OvdcComputePolicyUpdate { ovdc_id: "abc".into() }
        );
        assert_eq!(
            route("GET", "/api/cse/cluster/urn:vcloud:entity:cse:nativeCluster:1/config").expect("route"),
            Operation::ClusterConfig {
                cluster_id: "urn:vcloud:entity:cse:nativeCluster:1".into()
            }
        );
    }

    #[test]
    fn unknown_paths_are_not_found() {
        assert_eq!(status(route("GET", "/api/cse/ovdc")), 404);
        assert_eq!(status(route("GET", "/api/cse/ovdc/a/b/c")), 404);
        assert_eq!(status(route("GET", "/api/cse/node")), 404);
        assert_eq!(status(route("GET", "/api/other/system")), 404);
        assert_eq!(status(route("GET", "/api/cse")), 404);
    }

    #[test]
    fn wrong_method_is_not_allowed() {
        assert_eq!(status(route("DELETE", "/api/cse/system")), 405);
        assert_eq!(status(route("POST", "/api/cse/ovdc/abc")), 405);
        assert_eq!(status(route("GET", "/api/cse/nodes")), 405);
    }

    #[test]
    fn node_paths_are_routed() {
        assert_eq!(route("POST", "/api/cse/nodes").expect("route"), Operation::NodeCreate);
        assert_eq!(route("DELETE", "/api/cse/2.0/nodes").expect("route"), Operation::NodeDelete);
        assert_eq!(
            route("GET", "/api/cse/node/worker-1").expect("route"),
            Operation::NodeInfo {
                node_name: "worker-1".into()
            }
        );
    }
}
