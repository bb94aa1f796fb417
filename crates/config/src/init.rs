// SPDX-License-Identifier: Apache-2.0

//! Cgroup and mpam group declarations from `init.yaml`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One cgroup the daemon may move tasks into or tune controls of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CGroupConfig {
    /// Directory name under the cgroup v2 root.
    pub name: String,
    /// Small integer id requests use to address this cgroup.
    pub id: u8,
    /// Whether the daemon creates the directory at boot when absent.
    #[serde(default)]
    pub create: bool,
}

/// One mpam (cache partitioning) group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MpamGroupConfig {
    /// Group name as exposed by the mpam resctrl hierarchy.
    pub name: String,
    /// Small integer id requests use to address this group.
    pub id: u8,
    /// Relative priority of the group.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InitFile {
    #[serde(default)]
    cgroups: Vec<CGroupConfig>,
    #[serde(default)]
    mpam: Vec<MpamGroupConfig>,
}

/// Parsed init declarations. Defaults to no cgroups and no mpam groups.
#[derive(Debug, Clone, Default)]
pub struct InitConfig {
    /// Declared cgroups, in file order.
    pub cgroups: Vec<CGroupConfig>,
    /// Declared mpam groups, in file order.
    pub mpam: Vec<MpamGroupConfig>,
}

impl InitConfig {
    /// Loads `init.yaml`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, &e))?;
        Self::from_yaml(&text, path)
    }

    /// Parses from a YAML string.
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, Error> {
        let file: InitFile = serde_yaml::from_str(text).map_err(|e| Error::yaml(origin, &e))?;
        Ok(Self {
            cgroups: file.cgroups,
            mpam: file.mpam,
        })
    }

    /// Cgroup lookup by request-facing id.
    #[must_use]
    pub fn cgroup(&self, id: u8) -> Option<&CGroupConfig> {
        self.cgroups.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn parses_cgroups_and_mpam() {
        let yaml = r#"
cgroups:
  - name: background
    id: 0
    create: true
  - name: foreground
    id: 1
mpam:
  - name: gaming
    id: 2
    priority: 1
"#;
        let init = InitConfig::from_yaml(yaml, &PathBuf::from("init.yaml")).unwrap();
        assert_eq!(init.cgroups.len(), 2);
        assert_eq!(init.mpam.len(), 1);
        assert_eq!(init.cgroup(1).unwrap().name, "foreground");
        assert!(!init.cgroup(1).unwrap().create);
        assert!(init.cgroup(7).is_none());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let init = InitConfig::from_yaml("{}", &PathBuf::from("init.yaml")).unwrap();
        assert!(init.cgroups.is_empty());
        assert!(init.mpam.is_empty());
    }
}
