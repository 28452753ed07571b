//! Names of CSE-owned compute policies.
//!
//! vCD sees `cse----<name>`; users only ever see `<name>`.

use std::fmt;
use std::str::FromStr;

use error_stack::Report;

use super::error::PolicyError;

pub const CSE_POLICY_PREFIX: &str = "cse----";

/// User-facing name of a CSE-owned compute policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CsePolicyName(String);

impl CsePolicyName {
    /// Rejects empty names and names that already carry the prefix, which
    /// would otherwise be indistinguishable after stripping.
    pub fn new(display_name: impl Into<String>) -> Result<Self, Report<PolicyError>> {
        let display_name = display_name.into();
        let invalid = |reason: &str| {
            Report::new(PolicyError::InvalidName {
                name: display_name.clone(),
                reason: reason.to_string(),
            })
        };

        if display_name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if display_name.starts_with(CSE_POLICY_PREFIX) {
            return Err(invalid("name must not start with the CSE policy prefix"));
        }
        Ok(Self(display_name))
    }

    /// Parses a name as stored in vCD; `None` for policies CSE doesn't own.
    pub fn from_stored(stored: &str) -> Option<Self> {
        let display = stored.strip_prefix(CSE_POLICY_PREFIX)?;
        if display.is_empty() || display.starts_with(CSE_POLICY_PREFIX) {
            return None;
        }
        Some(Self(display.to_string()))
    }

    pub fn display_name(&self) -> &str {
        &self.0
    }

    /// Name as stored in vCD.
    pub fn stored(&self) -> String {
        policy_name(&self.0)
    }
}

impl fmt::Display for CsePolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `"cse----" + display_name`
pub fn policy_name(display_name: &str) -> String {
    format!("{CSE_POLICY_PREFIX}{display_name}")
}

/// Strips the CSE prefix if present.
pub fn display_name(stored: &str) -> &str {
    stored.strip_prefix(CSE_POLICY_PREFIX).unwrap_or(stored)
}

/// Kubernetes runtimes CSE exposes as placement policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum K8sRuntime {
    Native,
    TkgPlus,
    Tkgm,
}

impl K8sRuntime {
    pub const ALL: [K8sRuntime; 3] = [K8sRuntime::Native, K8sRuntime::TkgPlus, K8sRuntime::Tkgm];

    /// Display name of the placement policy backing this runtime.
    pub fn policy_display_name(self) -> &'static str {
        match self {
            K8sRuntime::Native => "native",
            K8sRuntime::TkgPlus => "tkg",
            K8sRuntime::Tkgm => "tkgm",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            K8sRuntime::Native => "native",
            K8sRuntime::TkgPlus => "TKG+",
            K8sRuntime::Tkgm => "TKGm",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            K8sRuntime::Native => "Placement policy for native Kubernetes clusters",
            K8sRuntime::TkgPlus => "Placement policy for TKG+ clusters",
            K8sRuntime::Tkgm => "Placement policy for TKGm clusters",
        }
    }

    pub fn policy_name(self) -> CsePolicyName {
        CsePolicyName(self.policy_display_name().to_string())
    }

    /// Runtime of a deployed cluster, guessed from its template name.
    ///
    /// `tkg` is checked first: TKG+ template names also contain `k8`.
    pub fn from_template_name(template_name: &str) -> Option<Self> {
        let name = template_name.to_ascii_lowercase();
        if name.contains("tkgm") {
            Some(K8sRuntime::Tkgm)
        } else if name.contains("tkg") {
            Some(K8sRuntime::TkgPlus)
        } else if name.contains("k8") {
            Some(K8sRuntime::Native)
        } else {
            None
        }
    }
}

impl FromStr for K8sRuntime {
    type Err = Report<PolicyError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(K8sRuntime::Native),
            "tkg" | "tkg+" | "tkgplus" => Ok(K8sRuntime::TkgPlus),
            "tkgm" | "tkg_m" => Ok(K8sRuntime::Tkgm),
            _ => Err(Report::new(PolicyError::InvalidName {
                name: s.to_string(),
                reason: "unknown kubernetes runtime".to_string(),
            })),
        }
    }
}

/// Normalises a requested runtime to its placement policy display name.
/// Names that are not a known runtime alias are passed through.
pub fn normalize_runtime_name(name: &str) -> String {
    name.parse::<K8sRuntime>()
        .map(|r| r.policy_display_name().to_string())
        .unwrap_or_else(|_| name.to_string())
}
