// SPDX-License-Identifier: Apache-2.0

//! Per-client bookkeeping: processes, their threads, trust, health.
//!
//! One read/write lock guards both tables. Reads (trust lookups, rate-limit
//! state) are the hot path; writers are entry creation, health updates, and
//! the garbage collector tearing entries down.

use parking_lot::RwLock;
use restune_common::{Handle, TrustLevel};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Full health, the starting point for every new thread.
pub const FULL_HEALTH: f64 = 100.0;

/// Probe resolving a pid to its trust level. The default implementation
/// reads `/proc/<pid>/status`; tests inject fixed answers.
pub type TrustProbe = Arc<dyn Fn(i32) -> Option<TrustLevel> + Send + Sync>;

/// Reads the `Uid:` line of `/proc/<pid>/status`. Effective uid 0 maps to
/// system trust. `None` when the file cannot be read or parsed.
#[must_use]
pub fn probe_proc_status(pid: i32) -> Option<TrustLevel> {
    let text = match std::fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(text) => text,
        Err(err) => {
            warn!(pid, %err, "failed to read process status");
            return None;
        }
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // Format: Uid: real effective saved fs
            let effective = rest.split_whitespace().nth(1)?.parse::<u32>().ok()?;
            return Some(if effective == 0 {
                TrustLevel::System
            } else {
                TrustLevel::ThirdParty
            });
        }
    }
    Some(TrustLevel::ThirdParty)
}

#[derive(Debug)]
struct PidEntry {
    tids: Vec<i32>,
    trust: Option<TrustLevel>,
}

#[derive(Debug)]
struct TidEntry {
    handles: HashSet<Handle>,
    health: f64,
    last_request_ms: i64,
}

#[derive(Default)]
struct Tables {
    pids: HashMap<i32, PidEntry>,
    tids: HashMap<i32, TidEntry>,
}

/// The client registry.
pub struct ClientRegistry {
    tables: RwLock<Tables>,
    trust_probe: TrustProbe,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry").finish_non_exhaustive()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// A registry probing `/proc` for trust.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trust_probe(Arc::new(probe_proc_status))
    }

    /// A registry with an injected trust probe, for tests.
    #[must_use]
    pub fn with_trust_probe(trust_probe: TrustProbe) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            trust_probe,
        }
    }

    /// True when both the pid and the tid are known.
    #[must_use]
    pub fn exists(&self, pid: i32, tid: i32) -> bool {
        let tables = self.tables.read();
        tables.pids.contains_key(&pid) && tables.tids.contains_key(&tid)
    }

    /// Idempotently creates the per-pid and per-tid entries. The trust probe
    /// runs once, on first sight of the pid.
    pub fn ensure(&self, pid: i32, tid: i32) {
        let mut tables = self.tables.write();
        if !tables.tids.contains_key(&tid) {
            let _ = tables.tids.insert(
                tid,
                TidEntry {
                    handles: HashSet::new(),
                    health: FULL_HEALTH,
                    last_request_ms: 0,
                },
            );
        }
        match tables.pids.get_mut(&pid) {
            Some(entry) => {
                if !entry.tids.contains(&tid) {
                    entry.tids.push(tid);
                }
            }
            None => {
                let trust = (self.trust_probe)(pid);
                let _ = tables.pids.insert(
                    pid,
                    PidEntry {
                        tids: vec![tid],
                        trust,
                    },
                );
            }
        }
    }

    /// Trust level of a known pid. `None` when the pid is unknown or its
    /// probe failed.
    #[must_use]
    pub fn trust_of(&self, pid: i32) -> Option<TrustLevel> {
        self.tables.read().pids.get(&pid).and_then(|e| e.trust)
    }

    /// Associates a handle with its submitting thread.
    pub fn attach_handle(&self, tid: i32, handle: Handle) {
        let mut tables = self.tables.write();
        if let Some(entry) = tables.tids.get_mut(&tid) {
            let _ = entry.handles.insert(handle);
        }
    }

    /// Drops a handle from its submitting thread.
    pub fn detach_handle(&self, tid: i32, handle: Handle) {
        let mut tables = self.tables.write();
        if let Some(entry) = tables.tids.get_mut(&tid) {
            let _ = entry.handles.remove(&handle);
        }
    }

    /// Snapshot of the outstanding handles of a thread.
    #[must_use]
    pub fn handles_of(&self, tid: i32) -> HashSet<Handle> {
        self.tables
            .read()
            .tids
            .get(&tid)
            .map(|e| e.handles.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the threads of a process.
    #[must_use]
    pub fn tids_of(&self, pid: i32) -> Vec<i32> {
        self.tables
            .read()
            .pids
            .get(&pid)
            .map(|e| e.tids.clone())
            .unwrap_or_default()
    }

    /// Every pid with an entry, for the pulse monitor sweep.
    #[must_use]
    pub fn active_pids(&self) -> Vec<i32> {
        self.tables.read().pids.keys().copied().collect()
    }

    /// Current health of a thread, `None` for unknown tids.
    #[must_use]
    pub fn health_of(&self, tid: i32) -> Option<f64> {
        self.tables.read().tids.get(&tid).map(|e| e.health)
    }

    /// Overwrites the health of a known thread.
    pub fn set_health(&self, tid: i32, health: f64) {
        let mut tables = self.tables.write();
        if let Some(entry) = tables.tids.get_mut(&tid) {
            entry.health = health;
        }
    }

    /// Timestamp (ms) of the last accepted request of a thread; 0 means
    /// never.
    #[must_use]
    pub fn last_request_ms(&self, tid: i32) -> Option<i64> {
        self.tables.read().tids.get(&tid).map(|e| e.last_request_ms)
    }

    /// Records the acceptance timestamp of a thread's request.
    pub fn set_last_request_ms(&self, tid: i32, now_ms: i64) {
        let mut tables = self.tables.write();
        if let Some(entry) = tables.tids.get_mut(&tid) {
            entry.last_request_ms = now_ms;
        }
    }

    /// Destroys a tid entry. Called only by the garbage collector. The pid
    /// entry goes with it once its last tid is gone.
    pub fn drop_tid(&self, tid: i32) {
        let mut tables = self.tables.write();
        let _ = tables.tids.remove(&tid);
        let mut emptied_pid = None;
        for (&pid, entry) in &mut tables.pids {
            entry.tids.retain(|&t| t != tid);
            if entry.tids.is_empty() {
                emptied_pid = Some(pid);
            }
        }
        if let Some(pid) = emptied_pid {
            let _ = tables.pids.remove(&pid);
        }
    }

    /// Destroys a pid entry and all of its tid entries. Called only by the
    /// liveness sweeper / garbage collector.
    pub fn drop_pid(&self, pid: i32) {
        let mut tables = self.tables.write();
        if let Some(entry) = tables.pids.remove(&pid) {
            for tid in entry.tids {
                let _ = tables.tids.remove(&tid);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A registry where every pid resolves to the given trust level.
    pub fn registry_with_trust(trust: TrustLevel) -> ClientRegistry {
        ClientRegistry::with_trust_probe(Arc::new(move |_| Some(trust)))
    }
}
