// SPDX-License-Identifier: Apache-2.0

//! The concurrency coordinator table.
//!
//! For every tunable instance (slot) the table keeps four doubly linked
//! lists, one per priority level, ordered according to the resource's
//! policy. The head of the highest nonempty list is the winner; its value is
//! what actually sits on the node. The table is owned by the dispatcher
//! thread exclusively, so no locking happens here — timers and collectors
//! that want a request gone re-enter through the queue.
//!
//! Nodes live in a generational arena; links are arena keys, and each
//! request records the keys it installed so removal never searches.

use crate::appliers::{ApplierRegistry, ResourceContext};
use crate::error::Error;
use crate::requests::Request;
use crate::resources::ResourceTable;
use crate::sysfs::DefaultsVault;
use restune_common::{Handle, Mode, TUNE_PRIORITY_LEVELS, TunePriority};
use restune_config::Policy;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

new_key_type! {
    /// Arena key of one [`CocoNode`].
    pub struct NodeKey;
}

/// One (request, resource, instance) element threaded into a slot list.
#[derive(Debug)]
struct CocoNode {
    request: Arc<Request>,
    /// Index of the resource inside the owning request.
    res_idx: usize,
    level: TunePriority,
    slot: usize,
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
}

impl CocoNode {
    fn value(&self) -> i32 {
        self.request.resources[self.res_idx].value()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Dll {
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
}

#[derive(Debug)]
struct SlotState {
    lists: [Dll; TUNE_PRIORITY_LEVELS],
    /// Which priority level currently holds the node, if any.
    applied_level: Option<TunePriority>,
    /// Cache of the values last written, to skip redundant re-applies.
    applied_values: Option<Vec<i32>>,
    /// Expanded backing path of this instance.
    path: String,
}

/// The conflict-resolution table.
pub struct CocoTable {
    resources: Arc<ResourceTable>,
    appliers: Arc<ApplierRegistry>,
    vault: Arc<DefaultsVault>,
    nodes: SlotMap<NodeKey, CocoNode>,
    slots: Vec<SlotState>,
    installed: HashMap<Handle, SmallVec<[NodeKey; 4]>>,
}

impl std::fmt::Debug for CocoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CocoTable")
            .field("slots", &self.slots.len())
            .field("nodes", &self.nodes.len())
            .field("requests", &self.installed.len())
            .finish_non_exhaustive()
    }
}

impl CocoTable {
    /// An empty table covering every slot of the resource table.
    #[must_use]
    pub fn new(
        resources: Arc<ResourceTable>,
        appliers: Arc<ApplierRegistry>,
        vault: Arc<DefaultsVault>,
    ) -> Self {
        let slots = (0..resources.total_slots())
            .map(|slot| SlotState {
                lists: [Dll::default(); TUNE_PRIORITY_LEVELS],
                applied_level: None,
                applied_values: None,
                path: resources.slot_path(slot).unwrap_or_default(),
            })
            .collect();
        Self {
            resources,
            appliers,
            vault,
            nodes: SlotMap::with_key(),
            slots,
            installed: HashMap::new(),
        }
    }

    /// Installs a request: one node per expanded tunable instance, placed
    /// per the resource's policy, applying new winners as they surface.
    ///
    /// Fails without touching the table when the current mode forbids the
    /// request or any resource fails expansion.
    pub fn insert(&mut self, request: &Arc<Request>, current_mode: Mode) -> Result<(), Error> {
        if (current_mode == Mode::SUSPEND || current_mode == Mode::DOZE)
            && !request.properties.modes.contains(current_mode)
        {
            return Err(Error::ModeIncompatible {
                modes: request.properties.modes,
                current: current_mode,
            });
        }
        if self.installed.contains_key(&request.handle) {
            debug!(handle = request.handle, "request already installed");
            return Ok(());
        }

        // Plan the whole expansion first so a failure mid-request cannot
        // leave half the nodes behind.
        let mut plan: Vec<(usize, SmallVec<[usize; 4]>)> = Vec::with_capacity(request.resources.len());
        for (res_idx, resource) in request.resources.iter().enumerate() {
            let config = self
                .resources
                .lookup(resource.opcode)
                .ok_or(Error::UnknownOpcode {
                    opcode: resource.opcode,
                })?;
            let slots = self.resources.expand(config, resource)?;
            plan.push((res_idx, slots));
        }

        let mut keys: SmallVec<[NodeKey; 4]> = SmallVec::new();
        for (res_idx, slots) in plan {
            for slot in slots {
                let key = self.link_node(request, res_idx, slot);
                keys.push(key);
                self.settle_insert(key);
            }
        }
        let _ = self.installed.insert(request.handle, keys);
        Ok(())
    }

    /// Removes every node a request installed. Returns false when the
    /// request had nothing in the table.
    pub fn remove(&mut self, handle: Handle) -> bool {
        let Some(keys) = self.installed.remove(&handle) else {
            return false;
        };
        for key in keys {
            self.remove_node(key);
        }
        true
    }

    /// True when the request currently has nodes installed.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.installed.contains_key(&handle)
    }

    /// Number of live nodes across all slots.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The priority level currently holding a slot.
    #[must_use]
    pub fn applied_level(&self, slot: usize) -> Option<TunePriority> {
        self.slots.get(slot).and_then(|s| s.applied_level)
    }

    /// The values last written to a slot.
    #[must_use]
    pub fn applied_values(&self, slot: usize) -> Option<&[i32]> {
        self.slots
            .get(slot)
            .and_then(|s| s.applied_values.as_deref())
    }

    /// True when no node is installed and every per-slot cache is clear.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        self.nodes.is_empty()
            && self.installed.is_empty()
            && self
                .slots
                .iter()
                .all(|s| s.applied_level.is_none() && s.applied_values.is_none())
    }

    /// Creates the node for (request, res_idx) and links it into the slot
    /// list dictated by the resource policy.
    fn link_node(&mut self, request: &Arc<Request>, res_idx: usize, slot: usize) -> NodeKey {
        let level = request.priority;
        let policy = self
            .resources
            .lookup(request.resources[res_idx].opcode)
            .map_or(Policy::InstantApply, |c| c.policy);
        let key = self.nodes.insert(CocoNode {
            request: request.clone(),
            res_idx,
            level,
            slot,
            prev: None,
            next: None,
        });

        match policy {
            Policy::InstantApply => self.link_at_head(key),
            Policy::LazyApply => self.link_at_tail(key),
            Policy::HigherIsBetter => {
                let anchor = self.find_ordered_anchor(key, |existing, new| new > existing);
                self.link_before_anchor(key, anchor);
            }
            Policy::LowerIsBetter => {
                let anchor = self.find_ordered_anchor(key, |existing, new| new < existing);
                self.link_before_anchor(key, anchor);
            }
        }
        key
    }

    /// Walks the slot list and returns the first node the new one must sit
    /// in front of. `wins(existing_value, new_value)` decides strict
    /// precedence; equal values keep walking, which makes ties FIFO.
    fn find_ordered_anchor(
        &self,
        key: NodeKey,
        wins: impl Fn(i32, i32) -> bool,
    ) -> Option<NodeKey> {
        let node = &self.nodes[key];
        let list = self.slots[node.slot].lists[node.level.index()];
        let new_value = node.value();
        let mut cursor = list.head;
        while let Some(current) = cursor {
            if current != key {
                let existing = &self.nodes[current];
                if wins(existing.value(), new_value) {
                    return Some(current);
                }
            }
            cursor = self.nodes[current].next;
        }
        None
    }

    fn link_at_head(&mut self, key: NodeKey) {
        let (slot, level) = {
            let node = &self.nodes[key];
            (node.slot, node.level.index())
        };
        let list = &mut self.slots[slot].lists[level];
        let old_head = list.head;
        list.head = Some(key);
        if list.tail.is_none() {
            list.tail = Some(key);
        }
        self.nodes[key].next = old_head;
        if let Some(old) = old_head {
            self.nodes[old].prev = Some(key);
        }
    }

    fn link_at_tail(&mut self, key: NodeKey) {
        let (slot, level) = {
            let node = &self.nodes[key];
            (node.slot, node.level.index())
        };
        let list = &mut self.slots[slot].lists[level];
        let old_tail = list.tail;
        list.tail = Some(key);
        if list.head.is_none() {
            list.head = Some(key);
        }
        self.nodes[key].prev = old_tail;
        if let Some(old) = old_tail {
            self.nodes[old].next = Some(key);
        }
    }

    /// Links `key` directly in front of `anchor`, or at the tail when there
    /// is no anchor.
    fn link_before_anchor(&mut self, key: NodeKey, anchor: Option<NodeKey>) {
        let Some(anchor) = anchor else {
            self.link_at_tail(key);
            return;
        };
        let (slot, level) = {
            let node = &self.nodes[key];
            (node.slot, node.level.index())
        };
        let anchor_prev = self.nodes[anchor].prev;
        self.nodes[key].prev = anchor_prev;
        self.nodes[key].next = Some(anchor);
        self.nodes[anchor].prev = Some(key);
        match anchor_prev {
            Some(prev) => self.nodes[prev].next = Some(key),
            None => self.slots[slot].lists[level].head = Some(key),
        }
    }

    /// The selection step after an insert: decide whether the new node makes
    /// its level the winner and re-apply if the winning value changed.
    fn settle_insert(&mut self, key: NodeKey) {
        let (slot, level) = {
            let node = &self.nodes[key];
            (node.slot, node.level)
        };
        match self.slots[slot].applied_level {
            None => {
                self.capture_default(slot);
                self.slots[slot].applied_level = Some(level);
                self.apply_winner(slot);
            }
            Some(cap) if level.outranks(cap) => {
                self.slots[slot].applied_level = Some(level);
                self.apply_winner(slot);
            }
            Some(cap)
                if level == cap && self.slots[slot].lists[level.index()].head == Some(key) =>
            {
                self.apply_winner(slot);
            }
            Some(_) => {}
        }
    }

    fn remove_node(&mut self, key: NodeKey) {
        let Some(node) = self.nodes.remove(key) else {
            return;
        };
        let slot = node.slot;
        let level = node.level;
        let was_head = node.prev.is_none();

        // Unlink in O(1).
        {
            let list = &mut self.slots[slot].lists[level.index()];
            match node.prev {
                Some(prev) => self.nodes[prev].next = node.next,
                None => list.head = node.next,
            }
            match node.next {
                Some(next) => self.nodes[next].prev = node.prev,
                None => list.tail = node.prev,
            }
        }

        if self.slots[slot].applied_level != Some(level) {
            return;
        }

        if self.slots[slot].lists[level.index()].head.is_none() {
            // The winning bucket drained; find the next nonempty one.
            let next_level = (0..TUNE_PRIORITY_LEVELS)
                .filter_map(TunePriority::from_index)
                .find(|l| self.slots[slot].lists[l.index()].head.is_some());
            match next_level {
                Some(next) => {
                    self.slots[slot].applied_level = Some(next);
                    self.apply_winner(slot);
                }
                None => self.reset_slot(slot, &node),
            }
        } else if was_head {
            // Same bucket, new head.
            self.apply_winner(slot);
        }
    }

    /// Captures the node's pre-tuning value into the vault, preferring a
    /// config-pinned default over reading the node.
    fn capture_default(&mut self, slot: usize) {
        let path = self.slots[slot].path.clone();
        if self.vault.get(&path).is_some() {
            return;
        }
        let pinned = self
            .resources
            .slot_owner(slot)
            .and_then(|(index, _)| {
                self.resources
                    .lookup_by_index(index)
                    .and_then(|c| c.default_value.clone())
            });
        match pinned {
            Some(value) => self.vault.store(&path, &value),
            None => {
                let _ = self.vault.capture_if_absent(&path);
            }
        }
    }

    /// Invokes the applier for the current winner of a slot, if its values
    /// differ from what is already on the node.
    fn apply_winner(&mut self, slot: usize) {
        let Some(level) = self.slots[slot].applied_level else {
            return;
        };
        let Some(head) = self.slots[slot].lists[level.index()].head else {
            return;
        };
        let winner = &self.nodes[head];
        let resource = &winner.request.resources[winner.res_idx];
        if self.slots[slot].applied_values.as_deref() == Some(resource.values.as_slice()) {
            return;
        }
        let Some(config) = self.resources.lookup(resource.opcode) else {
            return;
        };
        let path = &self.slots[slot].path;
        let default_value = self.vault.get(path);
        let ctx = ResourceContext {
            config,
            resource,
            path,
            default_value: default_value.as_deref(),
            pid: winner.request.pid,
            tid: winner.request.tid,
        };
        if let Err(err) = self.appliers.apply(&ctx) {
            warn!(%err, "applier failed");
        }
        let values = resource.values.clone();
        self.slots[slot].applied_values = Some(values);
    }

    /// Invokes the reset callback with the captured default and clears the
    /// slot caches. `last` is the node whose removal emptied the slot.
    fn reset_slot(&mut self, slot: usize, last: &CocoNode) {
        let resource = &last.request.resources[last.res_idx];
        if let Some(config) = self.resources.lookup(resource.opcode) {
            let path = &self.slots[slot].path;
            let default_value = self.vault.get(path);
            let ctx = ResourceContext {
                config,
                resource,
                path,
                default_value: default_value.as_deref(),
                pid: last.request.pid,
                tid: last.request.tid,
            };
            if let Err(err) = self.appliers.reset(&ctx) {
                warn!(%err, "reset failed");
            }
        }
        self.slots[slot].applied_level = None;
        self.slots[slot].applied_values = None;
    }
}
