use std::collections::{BTreeMap, HashMap, HashSet};

/// External registry/configuration collaborator. Supplies the group
/// properties the engine cannot derive on its own. All methods have
/// permissive defaults so the engine works without a real registry.
pub trait GroupRegistry: Send + Sync {
    /// Whether the group carries the job-sharing capability: any owner in
    /// the group may match any other owner's queues, and fair share is
    /// computed for the group as a whole.
    fn has_job_sharing(&self, _group: &str) -> bool {
        false
    }

    /// The virtual organisation a group belongs to.
    fn vo_for_group(&self, group: &str) -> String {
        group.to_string()
    }

    /// Configured share for the group, if any.
    fn share_for_group(&self, _group: &str) -> Option<f64> {
        None
    }

    /// Whether near-zero-share queues in this group may run as background
    /// work instead of being dropped to a proportional sliver.
    fn allows_background(&self, _group: &str) -> bool {
        false
    }
}

/// External hook that may redistribute per-owner shares based on signals
/// the engine does not see (e.g. running-job history). Only consulted when
/// shares correction is enabled in the configuration.
pub trait SharesCorrector: Send + Sync {
    fn correct_shares(
        &self,
        shares: &BTreeMap<String, f64>,
        group: Option<&str>,
    ) -> BTreeMap<String, f64>;
}

/// Pass-through corrector, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCorrector;

impl SharesCorrector for IdentityCorrector {
    fn correct_shares(
        &self,
        shares: &BTreeMap<String, f64>,
        _group: Option<&str>,
    ) -> BTreeMap<String, f64> {
        shares.clone()
    }
}

/// In-memory registry, used as the default collaborator and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    job_sharing_groups: HashSet<String>,
    background_groups: HashSet<String>,
    group_shares: HashMap<String, f64>,
    vo_overrides: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_sharing_group(mut self, group: impl Into<String>) -> Self {
        self.job_sharing_groups.insert(group.into());
        self
    }

    pub fn with_background_group(mut self, group: impl Into<String>) -> Self {
        self.background_groups.insert(group.into());
        self
    }

    pub fn with_group_share(mut self, group: impl Into<String>, share: f64) -> Self {
        self.group_shares.insert(group.into(), share);
        self
    }

    pub fn with_vo(mut self, group: impl Into<String>, vo: impl Into<String>) -> Self {
        self.vo_overrides.insert(group.into(), vo.into());
        self
    }
}

impl GroupRegistry for StaticRegistry {
    fn has_job_sharing(&self, group: &str) -> bool {
        self.job_sharing_groups.contains(group)
    }

    fn vo_for_group(&self, group: &str) -> String {
        self.vo_overrides
            .get(group)
            .cloned()
            .unwrap_or_else(|| group.to_string())
    }

    fn share_for_group(&self, group: &str) -> Option<f64> {
        self.group_shares.get(group).copied()
    }

    fn allows_background(&self, group: &str) -> bool {
        self.background_groups.contains(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_registry_defaults() {
        let reg = StaticRegistry::new();
        assert!(!reg.has_job_sharing("g1"));
        assert_eq!(reg.vo_for_group("g1"), "g1");
        assert!(reg.share_for_group("g1").is_none());
        assert!(!reg.allows_background("g1"));
    }

    #[test]
    fn static_registry_overrides() {
        let reg = StaticRegistry::new()
            .with_job_sharing_group("prod")
            .with_background_group("prod")
            .with_group_share("prod", 2000.0)
            .with_vo("prod", "lhcb");
        assert!(reg.has_job_sharing("prod"));
        assert!(reg.allows_background("prod"));
        assert_eq!(reg.share_for_group("prod"), Some(2000.0));
        assert_eq!(reg.vo_for_group("prod"), "lhcb");
    }

    #[test]
    fn identity_corrector_is_a_noop() {
        let shares: BTreeMap<String, f64> =
            [("alice".to_string(), 500.0), ("bob".to_string(), 500.0)]
                .into_iter()
                .collect();
        let corrected = IdentityCorrector.correct_shares(&shares, Some("g1"));
        assert_eq!(corrected, shares);
    }
}
