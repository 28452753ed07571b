use std::collections::BTreeMap;
use std::collections::BTreeSet;

use super::schema::VcenterConfig;

/// vCenters of the `vcs` section by name. Built once at startup and only
/// read afterwards.
#[derive(Debug, Clone, Default)]
pub struct VcenterRegistry {
    by_name: BTreeMap<String, VcenterConfig>,
}

impl VcenterRegistry {
    /// Later entries with a duplicate name replace earlier ones.
    pub fn new(vcs: &[VcenterConfig]) -> Self {
        Self {
            by_name: vcs.iter().map(|vc| (vc.name.clone(), vc.clone())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VcenterConfig> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn vc(name: &str, user: &str) -> VcenterConfig {
        VcenterConfig {
            name: name.into(),
            username: user.into(),
            password: "pw".into(),
            verify: true,
        }
    }

    #[test]
    fn lookup_by_name() {
        let registry = VcenterRegistry::new(&[vc("vc1", "a"), vc("vc2", "b"), vc("vc1", "c")]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("vc1").map(|v| v.username.as_str()), Some("c"));
        assert!(registry.get("vc3").is_none());
        assert_eq!(
            registry.names().into_iter().collect::<Vec<_>>(),
            vec!["vc1".to_string(), "vc2".to_string()]
        );
    }
}
