// SPDX-License-Identifier: Apache-2.0

//! The read-only resource table: catalog lookups plus the expansion of each
//! resource over the topology into conflict-table slots.
//!
//! Every resource occupies a contiguous span of slots, one per instance of
//! its apply scope: a global resource has one, a cluster resource one per
//! cluster, a core resource one per core, a cgroup resource one per declared
//! cgroup. Slot indices are dense and stable for the life of the table.

use crate::error::Error;
use crate::requests::ResourceRequest;
use crate::sysfs::{self, DefaultsVault};
use crate::topology::Topology;
use restune_config::{ApplyScope, CGroupConfig, ResourceCatalog, ResourceConfig};
use restune_common::Opcode;
use smallvec::{SmallVec, smallvec};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wildcard core / cluster value meaning "every instance".
pub const TARGET_ALL: u8 = 0xff;

#[derive(Debug, Clone, Copy)]
struct Span {
    base: usize,
    width: usize,
}

/// Catalog, topology, and slot layout in one immutable bundle.
#[derive(Debug)]
pub struct ResourceTable {
    catalog: ResourceCatalog,
    topology: Arc<Topology>,
    cgroups: Vec<CGroupConfig>,
    spans: Vec<Span>,
    /// Physical cluster id → position among clusters.
    cluster_pos: HashMap<u8, usize>,
    /// Global core id → position among cores.
    core_pos: HashMap<u8, usize>,
    total_slots: usize,
}

impl ResourceTable {
    /// Lays out the slot spans for a catalog on a topology.
    #[must_use]
    pub fn new(catalog: ResourceCatalog, topology: Arc<Topology>, cgroups: Vec<CGroupConfig>) -> Self {
        let mut cluster_pos = HashMap::new();
        let mut core_pos = HashMap::new();
        for (pos, cluster) in topology.clusters().iter().enumerate() {
            let _ = cluster_pos.insert(cluster.physical_id, pos);
        }
        for (pos, core) in topology
            .clusters()
            .iter()
            .flat_map(|c| c.cores.iter())
            .enumerate()
        {
            let _ = core_pos.insert(*core, pos);
        }

        let mut spans = Vec::with_capacity(catalog.len());
        let mut base = 0usize;
        for config in catalog.entries() {
            let width = match config.apply_scope {
                ApplyScope::Global => 1,
                ApplyScope::Cluster => topology.cluster_count(),
                ApplyScope::Core => topology.core_count(),
                ApplyScope::Cgroup => cgroups.len(),
            };
            spans.push(Span { base, width });
            base += width;
        }
        debug!(
            resources = catalog.len(),
            slots = base,
            "resource table laid out"
        );
        Self {
            catalog,
            topology,
            cgroups,
            spans,
            cluster_pos,
            core_pos,
            total_slots: base,
        }
    }

    /// The descriptor for an opcode, if registered.
    #[must_use]
    pub fn lookup(&self, opcode: Opcode) -> Option<&ResourceConfig> {
        self.catalog.get(opcode)
    }

    /// The catalog index of an opcode.
    #[must_use]
    pub fn index_of(&self, opcode: Opcode) -> Option<usize> {
        self.catalog.index_of(opcode)
    }

    /// The descriptor at a catalog index.
    #[must_use]
    pub fn lookup_by_index(&self, index: usize) -> Option<&ResourceConfig> {
        self.catalog.entries().get(index)
    }

    /// Every descriptor, in table order.
    pub fn catalog_entries(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.catalog.entries().iter()
    }

    /// The topology the table was laid out for.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The declared cgroups, in slot-offset order.
    #[must_use]
    pub fn cgroups(&self) -> &[CGroupConfig] {
        &self.cgroups
    }

    /// Total number of tunable instances across the catalog.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Expands a per-request resource into the slots it addresses.
    ///
    /// Core and cluster bytes are expected to already carry physical values
    /// (admission rewrites them); [`TARGET_ALL`] expands over the whole span.
    pub fn expand(
        &self,
        config: &ResourceConfig,
        resource: &ResourceRequest,
    ) -> Result<SmallVec<[usize; 4]>, Error> {
        let index = self
            .index_of(config.opcode)
            .ok_or(Error::UnknownOpcode {
                opcode: config.opcode,
            })?;
        let span = self.spans[index];
        let offsets: SmallVec<[usize; 4]> = match config.apply_scope {
            ApplyScope::Global => smallvec![0],
            ApplyScope::Cluster => {
                let cluster = resource.info.cluster();
                if cluster == TARGET_ALL {
                    (0..span.width).collect()
                } else {
                    let pos = self.cluster_pos.get(&cluster).copied().ok_or(
                        Error::UnknownTopology {
                            cluster,
                            core: resource.info.core(),
                        },
                    )?;
                    smallvec![pos]
                }
            }
            ApplyScope::Core => {
                let core = resource.info.core();
                if core == TARGET_ALL {
                    (0..span.width).collect()
                } else {
                    let pos =
                        self.core_pos
                            .get(&core)
                            .copied()
                            .ok_or(Error::UnknownTopology {
                                cluster: resource.info.cluster(),
                                core,
                            })?;
                    smallvec![pos]
                }
            }
            ApplyScope::Cgroup => {
                let id = resource.cgroup_id().ok_or_else(|| Error::MalformedRequest {
                    details: "cgroup resource without a cgroup id value".to_owned(),
                })?;
                let pos = self
                    .cgroups
                    .iter()
                    .position(|c| c.id == id)
                    .ok_or(Error::UnknownCGroup { id })?;
                smallvec![pos]
            }
        };
        Ok(offsets.iter().map(|off| span.base + off).collect())
    }

    /// The (catalog index, instance offset) behind a slot.
    #[must_use]
    pub fn slot_owner(&self, slot: usize) -> Option<(usize, usize)> {
        let index = self
            .spans
            .iter()
            .rposition(|span| span.base <= slot && slot < span.base + span.width)?;
        Some((index, slot - self.spans[index].base))
    }

    /// The expanded backing path of a slot.
    #[must_use]
    pub fn slot_path(&self, slot: usize) -> Option<String> {
        let (index, offset) = self.slot_owner(slot)?;
        let config = &self.catalog.entries()[index];
        Some(self.instance_path(config, offset))
    }

    /// Expands a resource's path format for one instance offset.
    #[must_use]
    pub fn instance_path(&self, config: &ResourceConfig, offset: usize) -> String {
        match config.apply_scope {
            ApplyScope::Global => config.path.clone(),
            ApplyScope::Cluster => {
                let physical = self
                    .topology
                    .clusters()
                    .get(offset)
                    .map_or(offset as u32, |c| c.physical_id as u32);
                sysfs::expand_path(&config.path, Some(physical), None)
            }
            ApplyScope::Core => {
                let core = self
                    .topology
                    .clusters()
                    .iter()
                    .flat_map(|c| c.cores.iter())
                    .nth(offset)
                    .map_or(offset as u32, |&c| c as u32);
                sysfs::expand_path(&config.path, Some(core), None)
            }
            ApplyScope::Cgroup => {
                let name = self.cgroups.get(offset).map_or("", |c| c.name.as_str());
                sysfs::expand_path(&config.path, None, Some(name))
            }
        }
    }

    /// Writes every captured default back to its node. Used by mode
    /// transitions and by the shutdown sweep.
    pub fn restore_defaults(&self, vault: &DefaultsVault) {
        for (path, value) in vault.snapshot() {
            if let Err(err) = sysfs::write_node(&path, &value) {
                warn!(path, %err, "failed to restore default value");
            }
        }
    }
}
