// SPDX-License-Identifier: Apache-2.0

//! Topology overrides from `target.yaml`.
//!
//! When present, the per-cluster layout declared here takes precedence over
//! anything discovered from sysfs. The logical→physical cluster map lets a
//! target renumber clusters without touching client code.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One cluster row of the override table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    /// Logical cluster id as clients address it.
    pub logical: u8,
    /// Physical cluster id as the kernel numbers it.
    pub physical: u8,
    /// Number of cores in the physical cluster.
    pub cores: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TargetFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    clusters: Vec<ClusterSpec>,
}

/// Parsed target declarations. An empty cluster table means "discover".
#[derive(Debug, Clone, Default)]
pub struct TargetConfig {
    /// Marketing / board name, used in logs only.
    pub name: Option<String>,
    /// Cluster override table, empty when discovery should be used.
    pub clusters: Vec<ClusterSpec>,
}

impl TargetConfig {
    /// Loads `target.yaml`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, &e))?;
        Self::from_yaml(&text, path)
    }

    /// Parses from a YAML string and validates the override table.
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, Error> {
        let file: TargetFile = serde_yaml::from_str(text).map_err(|e| Error::yaml(origin, &e))?;
        let config = Self {
            name: file.name,
            clusters: file.clusters,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        for (i, spec) in self.clusters.iter().enumerate() {
            if spec.cores == 0 {
                return Err(Error::InvalidTarget {
                    details: format!("cluster row {i} declares zero cores"),
                });
            }
            if self.clusters[..i].iter().any(|s| s.logical == spec.logical) {
                return Err(Error::InvalidTarget {
                    details: format!("duplicate logical cluster id {}", spec.logical),
                });
            }
            if self.clusters[..i].iter().any(|s| s.physical == spec.physical) {
                return Err(Error::InvalidTarget {
                    details: format!("duplicate physical cluster id {}", spec.physical),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn parses_cluster_table() {
        let yaml = r#"
name: devboard
clusters:
  - logical: 0
    physical: 1
    cores: 4
  - logical: 1
    physical: 0
    cores: 4
"#;
        let target = TargetConfig::from_yaml(yaml, &PathBuf::from("target.yaml")).unwrap();
        assert_eq!(target.name.as_deref(), Some("devboard"));
        assert_eq!(target.clusters.len(), 2);
        assert_eq!(target.clusters[0].physical, 1);
    }

    #[test]
    fn duplicate_logical_ids_are_rejected() {
        let yaml = r#"
clusters:
  - logical: 0
    physical: 0
    cores: 4
  - logical: 0
    physical: 1
    cores: 4
"#;
        assert!(matches!(
            TargetConfig::from_yaml(yaml, &PathBuf::from("target.yaml")),
            Err(Error::InvalidTarget { .. })
        ));
    }

    #[test]
    fn zero_core_cluster_is_rejected() {
        let yaml = r#"
clusters:
  - logical: 0
    physical: 0
    cores: 0
"#;
        assert!(matches!(
            TargetConfig::from_yaml(yaml, &PathBuf::from("target.yaml")),
            Err(Error::InvalidTarget { .. })
        ));
    }
}
