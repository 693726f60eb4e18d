//! Feature gates for the registration agent and hub controller
//!
//! The spoke agent and the hub controller carry separate default tables;
//! gates are toggled with a repeatable `--feature-gates Foo=true,Bar=false`
//! flag.

use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// A togglable feature of the registration control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    /// Collect spoke ClusterClaims and mirror them into cluster status.
    /// When disabled the claims field stays empty.
    ClusterClaim,

    /// Run the addon registration and lease controllers in the spoke agent.
    AddonManagement,

    /// Maintain a default cluster set on the hub; clusters without a
    /// clusterset label are added to it.
    DefaultClusterSet,

    /// Issue CSRs against the legacy certificates.k8s.io/v1beta1 endpoint.
    V1beta1CSRAPICompatibility,
}

impl Feature {
    fn parse(name: &str) -> Option<Feature> {
        match name {
            "ClusterClaim" => Some(Feature::ClusterClaim),
            "AddonManagement" => Some(Feature::AddonManagement),
            "DefaultClusterSet" => Some(Feature::DefaultClusterSet),
            "V1beta1CSRAPICompatibility" => Some(Feature::V1beta1CSRAPICompatibility),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Maturity of a feature gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Disabled by default, may change incompatibly
    Alpha,
    /// Enabled by default, still subject to change
    Beta,
}

/// A set of feature gates with defaults and overrides
#[derive(Clone, Debug)]
pub struct FeatureGates {
    gates: BTreeMap<Feature, (bool, Stage)>,
}

impl FeatureGates {
    /// Known gates for the spoke registration agent
    pub fn spoke_defaults() -> Self {
        let mut gates = BTreeMap::new();
        gates.insert(Feature::ClusterClaim, (true, Stage::Beta));
        gates.insert(Feature::AddonManagement, (false, Stage::Alpha));
        gates.insert(Feature::V1beta1CSRAPICompatibility, (false, Stage::Alpha));
        Self { gates }
    }

    /// Known gates for the hub registration controller
    pub fn hub_defaults() -> Self {
        let mut gates = BTreeMap::new();
        gates.insert(Feature::DefaultClusterSet, (false, Stage::Alpha));
        Self { gates }
    }

    /// Whether a feature is enabled. Unknown gates are disabled.
    pub fn enabled(&self, feature: Feature) -> bool {
        self.gates.get(&feature).map(|(on, _)| *on).unwrap_or(false)
    }

    /// Apply `Foo=true,Bar=false` style overrides.
    ///
    /// Unknown features and malformed entries are rejected so typos fail the
    /// process at startup instead of silently running with defaults.
    pub fn apply_overrides(&mut self, overrides: &str) -> Result<(), Error> {
        for entry in overrides.split(',').filter(|s| !s.trim().is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| Error::configuration(format!("malformed feature gate {entry:?}, expected Name=bool")))?;
            let feature = Feature::parse(name.trim())
                .ok_or_else(|| Error::configuration(format!("unknown feature gate {:?}", name.trim())))?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| Error::configuration(format!("invalid value {value:?} for feature gate {name}")))?;

            match self.gates.get_mut(&feature) {
                Some(gate) => gate.0 = enabled,
                None => {
                    return Err(Error::configuration(format!(
                        "feature gate {feature} is not available on this component"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoke_defaults() {
        let gates = FeatureGates::spoke_defaults();
        assert!(gates.enabled(Feature::ClusterClaim));
        assert!(!gates.enabled(Feature::AddonManagement));
        assert!(!gates.enabled(Feature::V1beta1CSRAPICompatibility));
        // hub-only gate is unknown on the spoke
        assert!(!gates.enabled(Feature::DefaultClusterSet));
    }

    #[test]
    fn hub_defaults() {
        let gates = FeatureGates::hub_defaults();
        assert!(!gates.enabled(Feature::DefaultClusterSet));
        assert!(!gates.enabled(Feature::ClusterClaim));
    }

    #[test]
    fn overrides_flip_gates() {
        let mut gates = FeatureGates::spoke_defaults();
        gates
            .apply_overrides("AddonManagement=true,ClusterClaim=false")
            .unwrap();
        assert!(gates.enabled(Feature::AddonManagement));
        assert!(!gates.enabled(Feature::ClusterClaim));
    }

    #[test]
    fn unknown_gate_is_rejected() {
        let mut gates = FeatureGates::spoke_defaults();
        assert!(gates.apply_overrides("NoSuchFeature=true").is_err());
    }

    #[test]
    fn gate_not_available_on_component_is_rejected() {
        let mut gates = FeatureGates::spoke_defaults();
        assert!(gates.apply_overrides("DefaultClusterSet=true").is_err());
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let mut gates = FeatureGates::spoke_defaults();
        assert!(gates.apply_overrides("ClusterClaim").is_err());
        assert!(gates.apply_overrides("ClusterClaim=yes").is_err());
        // empty segments are tolerated
        assert!(gates.apply_overrides("").is_ok());
        assert!(gates.apply_overrides("ClusterClaim=true,").is_ok());
    }
}
