// SPDX-License-Identifier: Apache-2.0

//! The applier / reset callback registry.
//!
//! Every resource code resolves to a pair of callbacks: the applier writes
//! the winning value to the backing node, the reset restores the captured
//! default when the last request referencing the node goes away. Built-in
//! callbacks cover scalar sysfs writes and the common cgroup operations;
//! vendor code registers additional ones by name before the catalog is
//! bound. Callbacks must be idempotent; failures are logged by the caller
//! and never retried.

use crate::error::Error;
use crate::requests::ResourceRequest;
use crate::sysfs;
use restune_common::Opcode;
use restune_config::{ApplyScope, ResourceConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a callback may need to act on one tunable instance.
#[derive(Debug)]
pub struct ResourceContext<'a> {
    /// The resource descriptor.
    pub config: &'a ResourceConfig,
    /// The per-request resource being applied or reset.
    pub resource: &'a ResourceRequest,
    /// The expanded backing path of this instance.
    pub path: &'a str,
    /// The captured default of this instance, when one exists.
    pub default_value: Option<&'a str>,
    /// Pid of the owning client.
    pub pid: i32,
    /// Tid of the owning client.
    pub tid: i32,
}

/// Callback outcome; the error string ends up in the log line.
pub type CallbackResult = Result<(), String>;

/// A registered callback.
pub type Callback = Arc<dyn Fn(&ResourceContext<'_>) -> CallbackResult + Send + Sync>;

/// The applier and reset callbacks of one resource code.
#[derive(Clone)]
pub struct CallbackPair {
    /// Writes the winning value.
    pub applier: Callback,
    /// Restores the default.
    pub reset: Callback,
}

/// Names of the built-in callbacks, usable from resource configs.
pub mod builtin {
    /// Write `values[0]` to the node; reset writes the captured default.
    pub const SCALAR_WRITE: &str = "scalar_write";
    /// Reset half of [`SCALAR_WRITE`].
    pub const SCALAR_RESET: &str = "scalar_reset";
    /// Write `values[1]` to a cgroup-expanded node.
    pub const CGROUP_SCALAR_WRITE: &str = "cgroup_scalar_write";
    /// Reset half of [`CGROUP_SCALAR_WRITE`].
    pub const CGROUP_SCALAR_RESET: &str = "cgroup_scalar_reset";
    /// Move the pid in `values[1]` into the cgroup.
    pub const CGROUP_MOVE_PID: &str = "cgroup_move_pid";
    /// Move the pid back to the root cgroup.
    pub const CGROUP_MOVE_PID_RESET: &str = "cgroup_move_pid_reset";
    /// Move the tid in `values[1]` into the cgroup.
    pub const CGROUP_MOVE_TID: &str = "cgroup_move_tid";
    /// Move the tid back to the root cgroup.
    pub const CGROUP_MOVE_TID_RESET: &str = "cgroup_move_tid_reset";
    /// Write the core list `values[1..]` to a cpuset file.
    pub const CPUSET_WRITE: &str = "cpuset_write";
    /// Reset half of [`CPUSET_WRITE`].
    pub const CPUSET_RESET: &str = "cpuset_reset";
    /// Like [`CPUSET_WRITE`] but also marks the partition isolated.
    pub const CPUSET_EXCLUSIVE: &str = "cpuset_exclusive";
    /// Reset half of [`CPUSET_EXCLUSIVE`].
    pub const CPUSET_EXCLUSIVE_RESET: &str = "cpuset_exclusive_reset";
    /// Write a `quota period` pair to a cpu.max style file.
    pub const CPU_TIME_LIMIT: &str = "cpu_time_limit";
    /// Reset half of [`CPU_TIME_LIMIT`].
    pub const CPU_TIME_LIMIT_RESET: &str = "cpu_time_limit_reset";
}

/// Code → callback-pair registry. Immutable once bound to a catalog.
#[derive(Default)]
pub struct ApplierRegistry {
    named: HashMap<String, Callback>,
    by_opcode: HashMap<u32, CallbackPair>,
}

impl std::fmt::Debug for ApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplierRegistry")
            .field("named", &self.named.len())
            .field("bound", &self.by_opcode.len())
            .finish()
    }
}

impl ApplierRegistry {
    /// A registry preloaded with the built-in callbacks.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register_named(builtin::SCALAR_WRITE, Arc::new(scalar_write));
        registry.register_named(builtin::SCALAR_RESET, Arc::new(scalar_reset));
        registry.register_named(builtin::CGROUP_SCALAR_WRITE, Arc::new(cgroup_scalar_write));
        registry.register_named(builtin::CGROUP_SCALAR_RESET, Arc::new(scalar_reset));
        registry.register_named(builtin::CGROUP_MOVE_PID, Arc::new(cgroup_move_task));
        registry.register_named(builtin::CGROUP_MOVE_PID_RESET, Arc::new(cgroup_move_task_reset));
        registry.register_named(builtin::CGROUP_MOVE_TID, Arc::new(cgroup_move_task));
        registry.register_named(builtin::CGROUP_MOVE_TID_RESET, Arc::new(cgroup_move_task_reset));
        registry.register_named(builtin::CPUSET_WRITE, Arc::new(cpuset_write));
        registry.register_named(builtin::CPUSET_RESET, Arc::new(scalar_reset));
        registry.register_named(builtin::CPUSET_EXCLUSIVE, Arc::new(cpuset_exclusive));
        registry.register_named(builtin::CPUSET_EXCLUSIVE_RESET, Arc::new(cpuset_exclusive_reset));
        registry.register_named(builtin::CPU_TIME_LIMIT, Arc::new(cpu_time_limit));
        registry.register_named(builtin::CPU_TIME_LIMIT_RESET, Arc::new(cpu_time_limit_reset));
        registry
    }

    /// Registers (or replaces) a named callback. Must happen before
    /// [`Self::bind_catalog`] resolves configs against the name table.
    pub fn register_named(&mut self, name: &str, callback: Callback) {
        let _ = self.named.insert(name.to_owned(), callback);
    }

    /// Explicitly binds a callback pair to a resource code.
    pub fn register_pair(&mut self, opcode: Opcode, pair: CallbackPair) {
        let _ = self.by_opcode.insert(opcode.raw(), pair);
    }

    /// Resolves every catalog entry to its callback pair: the named ones the
    /// config asks for, or the scope defaults.
    pub fn bind_catalog<'a>(
        &mut self,
        configs: impl Iterator<Item = &'a ResourceConfig>,
    ) -> Result<(), Error> {
        for config in configs {
            let (default_apply, default_reset) = scope_defaults(config.apply_scope);
            let applier = self.resolve(config, config.applier.as_deref(), default_apply)?;
            let reset = self.resolve(config, config.reset.as_deref(), default_reset)?;
            let _ = self
                .by_opcode
                .insert(config.opcode.raw(), CallbackPair { applier, reset });
        }
        debug!(bound = self.by_opcode.len(), "applier registry bound");
        Ok(())
    }

    fn resolve(
        &self,
        config: &ResourceConfig,
        requested: Option<&str>,
        fallback: &str,
    ) -> Result<Callback, Error> {
        let name = requested.unwrap_or(fallback);
        self.named.get(name).cloned().ok_or_else(|| Error::Init {
            details: format!(
                "resource {} references unknown callback `{name}`",
                config.opcode
            ),
        })
    }

    /// The callback pair bound to a resource code.
    #[must_use]
    pub fn pair_for(&self, opcode: Opcode) -> Option<&CallbackPair> {
        self.by_opcode.get(&opcode.raw())
    }

    /// Runs the applier for a context, mapping failures to
    /// [`Error::CallbackFailed`]. The caller logs and moves on.
    pub fn apply(&self, ctx: &ResourceContext<'_>) -> Result<(), Error> {
        let pair = self
            .pair_for(ctx.config.opcode)
            .ok_or_else(|| Error::Init {
                details: format!("no callbacks bound for resource {}", ctx.config.opcode),
            })?;
        (pair.applier)(ctx).map_err(|details| Error::CallbackFailed {
            callback: ctx
                .config
                .applier
                .clone()
                .unwrap_or_else(|| "default applier".to_owned()),
            opcode: ctx.config.opcode,
            details,
        })
    }

    /// Runs the reset for a context, mapping failures like [`Self::apply`].
    pub fn reset(&self, ctx: &ResourceContext<'_>) -> Result<(), Error> {
        let pair = self
            .pair_for(ctx.config.opcode)
            .ok_or_else(|| Error::Init {
                details: format!("no callbacks bound for resource {}", ctx.config.opcode),
            })?;
        (pair.reset)(ctx).map_err(|details| Error::CallbackFailed {
            callback: ctx
                .config
                .reset
                .clone()
                .unwrap_or_else(|| "default reset".to_owned()),
            opcode: ctx.config.opcode,
            details,
        })
    }
}

const fn scope_defaults(scope: ApplyScope) -> (&'static str, &'static str) {
    match scope {
        ApplyScope::Global | ApplyScope::Cluster | ApplyScope::Core => {
            (builtin::SCALAR_WRITE, builtin::SCALAR_RESET)
        }
        ApplyScope::Cgroup => (builtin::CGROUP_SCALAR_WRITE, builtin::CGROUP_SCALAR_RESET),
    }
}

fn write_or_detail(path: &str, value: &str) -> CallbackResult {
    sysfs::write_node(path, value).map_err(|err| format!("write `{value}` to {path}: {err}"))
}

fn scalar_write(ctx: &ResourceContext<'_>) -> CallbackResult {
    write_or_detail(ctx.path, &ctx.resource.value().to_string())
}

fn scalar_reset(ctx: &ResourceContext<'_>) -> CallbackResult {
    match ctx.default_value {
        Some(default) if !default.is_empty() => write_or_detail(ctx.path, default),
        _ => {
            warn!(path = ctx.path, "no captured default, leaving node as-is");
            Ok(())
        }
    }
}

fn second_value(ctx: &ResourceContext<'_>) -> Result<i32, String> {
    ctx.resource
        .values
        .get(1)
        .copied()
        .ok_or_else(|| "expected [cgroup_id, value]".to_owned())
}

fn cgroup_scalar_write(ctx: &ResourceContext<'_>) -> CallbackResult {
    let value = second_value(ctx)?;
    write_or_detail(ctx.path, &value.to_string())
}

/// Derives the root-hierarchy counterpart of a cgroup-expanded path by
/// dropping the `%s/` component, e.g. `/sys/fs/cgroup/%s/cgroup.procs` →
/// `/sys/fs/cgroup/cgroup.procs`.
fn root_counterpart(format: &str) -> String {
    format.replacen("%s/", "", 1)
}

fn cgroup_move_task(ctx: &ResourceContext<'_>) -> CallbackResult {
    let task = second_value(ctx)?;
    write_or_detail(ctx.path, &task.to_string())
}

fn cgroup_move_task_reset(ctx: &ResourceContext<'_>) -> CallbackResult {
    let task = second_value(ctx)?;
    write_or_detail(&root_counterpart(&ctx.config.path), &task.to_string())
}

fn core_list(ctx: &ResourceContext<'_>) -> Result<String, String> {
    let cores = ctx.resource.values.get(1..).unwrap_or(&[]);
    if cores.is_empty() {
        return Err("expected [cgroup_id, core...]".to_owned());
    }
    Ok(cores
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn cpuset_write(ctx: &ResourceContext<'_>) -> CallbackResult {
    let list = core_list(ctx)?;
    write_or_detail(ctx.path, &list)
}

fn partition_file(path: &str) -> String {
    format!("{path}.partition")
}

fn cpuset_exclusive(ctx: &ResourceContext<'_>) -> CallbackResult {
    let list = core_list(ctx)?;
    write_or_detail(ctx.path, &list)?;
    write_or_detail(&partition_file(ctx.path), "isolated")
}

fn cpuset_exclusive_reset(ctx: &ResourceContext<'_>) -> CallbackResult {
    // The apply side writes "isolated"; the captured default covers only the
    // core list, so the partition goes back to the kernel's neutral value.
    write_or_detail(&partition_file(ctx.path), "member")?;
    scalar_reset(ctx)
}

fn cpu_time_limit(ctx: &ResourceContext<'_>) -> CallbackResult {
    let quota = second_value(ctx)?;
    let period = ctx.resource.values.get(2).copied().unwrap_or(100_000);
    write_or_detail(ctx.path, &format!("{quota} {period}"))
}

fn cpu_time_limit_reset(ctx: &ResourceContext<'_>) -> CallbackResult {
    match ctx.default_value {
        Some(default) if !default.is_empty() => write_or_detail(ctx.path, default),
        _ => write_or_detail(ctx.path, "max 100000"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use restune_common::ResourceInfo;
    use restune_config::ResourceCatalog;
    use std::path::PathBuf;

    fn config(opcode: u32, path: &str, scope: &str, applier: Option<&str>) -> ResourceConfig {
        let applier_line = applier
            .map(|a| format!("    applier: {a}\n"))
            .unwrap_or_default();
        let yaml = format!(
            r#"
resources:
  - name: test_resource
    path: "{path}"
    opcode: "{opcode:#010x}"
    apply_scope: {scope}
{applier_line}"#
        );
        let catalog =
            ResourceCatalog::from_common_yaml(&yaml, &PathBuf::from("resources.yaml")).unwrap();
        catalog.entries()[0].clone()
    }

    fn resource(values: Vec<i32>) -> ResourceRequest {
        ResourceRequest {
            opcode: Opcode::from_raw(0x0001_0000),
            info: ResourceInfo::default(),
            optional_info: 0,
            values,
        }
    }

    fn bound_registry(config: &ResourceConfig) -> ApplierRegistry {
        let mut registry = ApplierRegistry::with_builtins();
        registry.bind_catalog(std::iter::once(config)).unwrap();
        registry
    }

    #[test]
    fn scalar_write_and_reset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, "42").unwrap();
        let node_str = node.to_string_lossy().into_owned();

        let config = config(0x0001_0000, &node_str, "global", None);
        let registry = bound_registry(&config);
        let res = resource(vec![900]);

        let ctx = ResourceContext {
            config: &config,
            resource: &res,
            path: &node_str,
            default_value: Some("42"),
            pid: 1,
            tid: 1,
        };
        registry.apply(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "900");
        registry.reset(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "42");
    }

    #[test]
    fn missing_default_leaves_node_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, "500").unwrap();
        let node_str = node.to_string_lossy().into_owned();

        let config = config(0x0001_0000, &node_str, "global", None);
        let registry = bound_registry(&config);
        let res = resource(vec![900]);
        let ctx = ResourceContext {
            config: &config,
            resource: &res,
            path: &node_str,
            default_value: None,
            pid: 1,
            tid: 1,
        };
        registry.reset(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "500");
    }

    #[test]
    fn move_pid_reset_targets_root_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bg")).unwrap();
        let format = format!("{}/%s/cgroup.procs", dir.path().display());
        let member = dir.path().join("bg/cgroup.procs");
        let root = dir.path().join("cgroup.procs");
        std::fs::write(&member, "").unwrap();
        std::fs::write(&root, "").unwrap();

        let config = config(
            0x0001_0001,
            &format,
            "cgroup",
            Some(builtin::CGROUP_MOVE_PID),
        );
        let mut registry = ApplierRegistry::with_builtins();
        let mut config_with_reset = config.clone();
        config_with_reset.reset = Some(builtin::CGROUP_MOVE_PID_RESET.to_owned());
        registry
            .bind_catalog(std::iter::once(&config_with_reset))
            .unwrap();

        let expanded = sysfs::expand_path(&format, None, Some("bg"));
        let res = resource(vec![0, 4321]);
        let ctx = ResourceContext {
            config: &config_with_reset,
            resource: &res,
            path: &expanded,
            default_value: None,
            pid: 4321,
            tid: 4321,
        };
        registry.apply(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&member).unwrap(), "4321");
        registry.reset(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&root).unwrap(), "4321");
    }

    #[test]
    fn exclusive_cpuset_isolates_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let cpus = dir.path().join("cpuset.cpus");
        let partition = dir.path().join("cpuset.cpus.partition");
        std::fs::write(&cpus, "0-7").unwrap();
        std::fs::write(&partition, "member").unwrap();
        let cpus_str = cpus.to_string_lossy().into_owned();

        let mut config = config(
            0x0001_0002,
            &cpus_str,
            "cgroup",
            Some(builtin::CPUSET_EXCLUSIVE),
        );
        config.reset = Some(builtin::CPUSET_EXCLUSIVE_RESET.to_owned());
        let registry = bound_registry(&config);

        let res = resource(vec![0, 2, 3]);
        let ctx = ResourceContext {
            config: &config,
            resource: &res,
            path: &cpus_str,
            default_value: Some("0-7"),
            pid: 1,
            tid: 1,
        };
        registry.apply(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&cpus).unwrap(), "2,3");
        assert_eq!(std::fs::read_to_string(&partition).unwrap(), "isolated");

        registry.reset(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&cpus).unwrap(), "0-7");
        assert_eq!(std::fs::read_to_string(&partition).unwrap(), "member");
    }

    #[test]
    fn unknown_callback_name_fails_binding() {
        let config = config(0x0001_0003, "/sys/x", "global", Some("does_not_exist"));
        let mut registry = ApplierRegistry::with_builtins();
        assert!(matches!(
            registry.bind_catalog(std::iter::once(&config)),
            Err(Error::Init { .. })
        ));
    }
}
