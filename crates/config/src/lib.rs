// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the resource tuner.
//!
//! Four YAML inputs feed the daemon:
//! - `resources.yaml` — the catalog of tunable descriptors,
//! - `properties.yaml` — flat string properties (rate limits, timer periods,
//!   logging, socket path),
//! - `init.yaml` — cgroup and mpam group declarations,
//! - `target.yaml` — topology overrides (cluster maps, core counts).
//!
//! Each input has a serde model with strict field checking, a validation pass,
//! and, for resources and target data, a custom overlay layer that lets a
//! vendor drop-in file extend or replace common entries. Missing mandatory
//! files abort startup; optional files fall back to built-in defaults.

pub mod error;
pub mod init;
pub mod properties;
pub mod resources;
pub mod target;

pub use crate::error::Error;
pub use crate::init::{CGroupConfig, InitConfig, MpamGroupConfig};
pub use crate::properties::{LogLevel, Properties, TunerSettings};
pub use crate::resources::{ApplyScope, Permission, Policy, ResourceCatalog, ResourceConfig};
pub use crate::target::TargetConfig;

use std::path::{Path, PathBuf};

/// Locations of the YAML config inputs.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Mandatory resource catalog.
    pub resources: PathBuf,
    /// Optional vendor overlay for the resource catalog.
    pub resources_custom: Option<PathBuf>,
    /// Mandatory flat properties.
    pub properties: PathBuf,
    /// Optional cgroup / mpam declarations.
    pub init: Option<PathBuf>,
    /// Optional topology overrides.
    pub target: Option<PathBuf>,
}

impl ConfigPaths {
    /// The installed locations the daemon reads when no override is given.
    #[must_use]
    pub fn installed() -> Self {
        let base = Path::new("/etc/resource-tuner");
        Self {
            resources: base.join("resources.yaml"),
            resources_custom: Some(base.join("custom/resources.yaml")),
            properties: base.join("properties.yaml"),
            init: Some(base.join("init.yaml")),
            target: Some(base.join("target.yaml")),
        }
    }

    /// Paths rooted at an arbitrary directory, custom overlay included.
    /// Used by tests and by the `--config-dir` CLI override.
    #[must_use]
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            resources: base.join("resources.yaml"),
            resources_custom: Some(base.join("custom/resources.yaml")),
            properties: base.join("properties.yaml"),
            init: Some(base.join("init.yaml")),
            target: Some(base.join("target.yaml")),
        }
    }
}

/// The fully parsed and validated configuration set.
#[derive(Debug, Clone)]
pub struct ConfigSet {
    /// Resource catalog after overlay and validation.
    pub resources: ResourceCatalog,
    /// Flat properties.
    pub properties: Properties,
    /// Cgroup / mpam declarations (defaults when the file is absent).
    pub init: InitConfig,
    /// Topology overrides (defaults when the file is absent).
    pub target: TargetConfig,
}

impl ConfigSet {
    /// Loads every input. Resources and properties are mandatory; a missing
    /// init or target file yields its default.
    pub fn load(paths: &ConfigPaths) -> Result<Self, Error> {
        let resources = ResourceCatalog::load(
            &paths.resources,
            paths.resources_custom.as_deref(),
        )?;
        let properties = Properties::load(&paths.properties)?;
        let init = match &paths.init {
            Some(path) if path.exists() => InitConfig::load(path)?,
            _ => InitConfig::default(),
        };
        let target = match &paths.target {
            Some(path) if path.exists() => TargetConfig::load(path)?,
            _ => TargetConfig::default(),
        };
        Ok(Self {
            resources,
            properties,
            init,
            target,
        })
    }
}
