// SPDX-License-Identifier: Apache-2.0

//! The resource catalog: one descriptor per tunable class.
//!
//! Two layers feed the catalog. The common layer ships with the daemon and is
//! lenient: malformed entries are skipped with a warning so one bad line does
//! not take the whole target down. The vendor overlay is strict: it is
//! hand-written per target and a mistake there should fail loudly. Overlay
//! entries replace common entries with the same opcode; brand-new overlay
//! entries must carry the custom opcode bit.

use crate::error::Error;
use restune_common::{Mode, Opcode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Permission level required to tune a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Only effective-uid-0 clients.
    System,
    /// Any client.
    #[default]
    ThirdParty,
}

/// How concurrent requests on the same tunable instance are reconciled
/// within one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// The newest request wins.
    #[default]
    InstantApply,
    /// The numerically largest value wins; ties go to the earlier request.
    HigherIsBetter,
    /// The numerically smallest value wins; ties go to the earlier request.
    LowerIsBetter,
    /// First-in-first-out: the oldest request holds the tunable.
    LazyApply,
}

/// How a resource expands over the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplyScope {
    /// One endpoint for the whole machine.
    #[default]
    Global,
    /// One endpoint per cluster.
    Cluster,
    /// One endpoint per core.
    Core,
    /// One endpoint per named cgroup.
    Cgroup,
}

/// Mode names as they appear in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ModeName {
    Resume,
    Suspend,
    Doze,
}

impl From<ModeName> for Mode {
    fn from(name: ModeName) -> Self {
        match name {
            ModeName::Resume => Mode::RESUME,
            ModeName::Suspend => Mode::SUSPEND,
            ModeName::Doze => Mode::DOZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceFile {
    resources: Vec<ResourceEntry>,
}

/// One raw YAML entry, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceEntry {
    name: String,
    /// Backing path format string: `%d` expands to a core or cluster id,
    /// `%s` to a cgroup name.
    path: String,
    /// Hex opcode, e.g. `"0x00040000"`.
    opcode: String,
    #[serde(default = "default_high_threshold")]
    high_threshold: i32,
    #[serde(default)]
    low_threshold: i32,
    #[serde(default)]
    permission: Permission,
    #[serde(default = "default_modes")]
    modes: Vec<ModeName>,
    #[serde(default = "default_true")]
    supported: bool,
    #[serde(default)]
    policy: Policy,
    #[serde(default)]
    apply_scope: ApplyScope,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    applier: Option<String>,
    #[serde(default)]
    reset: Option<String>,
}

const fn default_high_threshold() -> i32 {
    i32::MAX
}

const fn default_true() -> bool {
    true
}

fn default_modes() -> Vec<ModeName> {
    vec![ModeName::Resume]
}

/// A validated tunable descriptor. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// The resource class identifier.
    pub opcode: Opcode,
    /// Human-readable name, used in logs only.
    pub name: String,
    /// Backing path format string (`%d` core/cluster, `%s` cgroup name).
    pub path: String,
    /// Inclusive lower bound for single-valued requests.
    pub low_threshold: i32,
    /// Inclusive upper bound for single-valued requests.
    pub high_threshold: i32,
    /// Trust level required to tune this resource.
    pub permission: Permission,
    /// Modes this resource may stay applied in.
    pub modes: Mode,
    /// Whether tuning is available on this target at all.
    pub supported: bool,
    /// Conflict policy within one priority level.
    pub policy: Policy,
    /// Topology expansion of the backing path.
    pub apply_scope: ApplyScope,
    /// Optional applier callback id; `None` selects the scope default.
    pub applier: Option<String>,
    /// Optional reset callback id; `None` selects the scope default.
    pub reset: Option<String>,
    /// Config-pinned default value. When absent the default is captured from
    /// the node right before the first apply.
    pub default_value: Option<String>,
}

impl ResourceEntry {
    fn validate(self) -> Result<ResourceConfig, String> {
        let trimmed = self.opcode.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| format!("opcode `{trimmed}` is not hex"))?;
        let raw = u32::from_str_radix(digits, 16)
            .map_err(|e| format!("opcode `{trimmed}` is not hex: {e}"))?;
        if self.name.is_empty() {
            return Err("empty name".to_owned());
        }
        if self.path.is_empty() {
            return Err("empty path".to_owned());
        }
        if self.low_threshold > self.high_threshold {
            return Err(format!(
                "low threshold {} exceeds high threshold {}",
                self.low_threshold, self.high_threshold
            ));
        }
        let mut modes = Mode::empty();
        for name in self.modes {
            modes |= Mode::from(name);
        }
        if modes.is_empty() {
            return Err("empty mode list".to_owned());
        }
        Ok(ResourceConfig {
            opcode: Opcode::from_raw(raw),
            name: self.name,
            path: self.path,
            low_threshold: self.low_threshold,
            high_threshold: self.high_threshold,
            permission: self.permission,
            modes,
            supported: self.supported,
            policy: self.policy,
            apply_scope: self.apply_scope,
            applier: self.applier,
            reset: self.reset,
            default_value: self.default,
        })
    }
}

/// The merged, validated resource catalog.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    entries: Vec<ResourceConfig>,
    by_opcode: HashMap<u32, usize>,
}

impl ResourceCatalog {
    /// Loads the common catalog plus, when present, the vendor overlay.
    pub fn load(common: &Path, custom: Option<&Path>) -> Result<Self, Error> {
        if !common.exists() {
            return Err(Error::MissingMandatory {
                path: common.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(common).map_err(|e| Error::file_read(common, &e))?;
        let mut catalog = Self::from_common_yaml(&text, common)?;
        if let Some(path) = custom {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, &e))?;
                catalog.apply_overlay_yaml(&text, path)?;
            }
        }
        Ok(catalog)
    }

    /// Parses the lenient common layer from a YAML string.
    pub fn from_common_yaml(text: &str, origin: &Path) -> Result<Self, Error> {
        let file: ResourceFile =
            serde_yaml::from_str(text).map_err(|e| Error::yaml(origin, &e))?;
        let mut catalog = Self::default();
        for entry in file.resources {
            let name = entry.name.clone();
            match entry.validate() {
                Ok(config) => catalog.register(config),
                Err(details) => {
                    warn!(resource = %name, %details, "skipping malformed resource entry");
                }
            }
        }
        debug!(count = catalog.entries.len(), "resource catalog loaded");
        Ok(catalog)
    }

    /// Applies the strict vendor overlay from a YAML string.
    pub fn apply_overlay_yaml(&mut self, text: &str, origin: &Path) -> Result<(), Error> {
        let file: ResourceFile =
            serde_yaml::from_str(text).map_err(|e| Error::yaml(origin, &e))?;
        for entry in file.resources {
            let name = entry.name.clone();
            let config = entry.validate().map_err(|details| Error::InvalidResource {
                name: name.clone(),
                details,
            })?;
            if !self.by_opcode.contains_key(&config.opcode.raw()) && !config.opcode.is_custom() {
                return Err(Error::InvalidResource {
                    name,
                    details: format!(
                        "new overlay resource {} must set the custom opcode bit",
                        config.opcode
                    ),
                });
            }
            self.register(config);
        }
        Ok(())
    }

    fn register(&mut self, config: ResourceConfig) {
        match self.by_opcode.get(&config.opcode.raw()) {
            Some(&idx) => self.entries[idx] = config,
            None => {
                let _ = self
                    .by_opcode
                    .insert(config.opcode.raw(), self.entries.len());
                self.entries.push(config);
            }
        }
    }

    /// Looks up a descriptor by opcode.
    #[must_use]
    pub fn get(&self, opcode: Opcode) -> Option<&ResourceConfig> {
        self.by_opcode
            .get(&opcode.raw())
            .map(|&idx| &self.entries[idx])
    }

    /// Table index of a descriptor, stable for the life of the catalog.
    #[must_use]
    pub fn index_of(&self, opcode: Opcode) -> Option<usize> {
        self.by_opcode.get(&opcode.raw()).copied()
    }

    /// All descriptors in table order.
    #[must_use]
    pub fn entries(&self) -> &[ResourceConfig] {
        &self.entries
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no descriptor was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
