// SPDX-License-Identifier: Apache-2.0

//! CPU topology: physical clusters, core numbering, and the logical mapping.
//!
//! Three sources, in precedence order: the target config override, the
//! cpufreq policy directories (`related_cpus` per policy), and, as a last
//! resort, a uniform split of the online-CPU count. Logical cluster ids index
//! clusters sorted by their first physical core; logical core ids count from
//! 1 within a cluster, matching the client API.

use restune_config::TargetConfig;
use std::path::Path;
use tracing::{debug, warn};

/// One physical cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Physical cluster id.
    pub physical_id: u8,
    /// Global ids of the cores in this cluster, ascending.
    pub cores: Vec<u8>,
}

/// The discovered (or declared) CPU topology. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    clusters: Vec<Cluster>,
}

impl Topology {
    /// Builds the topology, honoring the override precedence.
    #[must_use]
    pub fn detect(target: &TargetConfig) -> Self {
        if !target.clusters.is_empty() {
            return Self::from_target(target);
        }
        match Self::from_cpufreq(Path::new("/sys/devices/system/cpu/cpufreq")) {
            Some(topology) => topology,
            None => {
                warn!("cpufreq policy scan failed, assuming a single uniform cluster");
                Self::uniform_fallback(online_cpu_count())
            }
        }
    }

    /// Topology declared by the target config.
    #[must_use]
    pub fn from_target(target: &TargetConfig) -> Self {
        let mut specs: Vec<_> = target.clusters.clone();
        specs.sort_by_key(|spec| spec.logical);
        let mut clusters = Vec::with_capacity(specs.len());
        let mut next_core = 0u8;
        for spec in specs {
            let cores = (next_core..next_core + spec.cores).collect();
            next_core += spec.cores;
            clusters.push(Cluster {
                physical_id: spec.physical,
                cores,
            });
        }
        Self { clusters }
    }

    /// Scans `policy*` directories for `related_cpus` files. Returns `None`
    /// when the directory is missing or holds no readable policy.
    pub fn from_cpufreq(base: &Path) -> Option<Self> {
        let mut policy_dirs: Vec<_> = std::fs::read_dir(base)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("policy"))
            })
            .collect();
        policy_dirs.sort();

        let mut clusters = Vec::new();
        for (idx, dir) in policy_dirs.iter().enumerate() {
            let related = dir.join("related_cpus");
            let text = match std::fs::read_to_string(&related) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %related.display(), %err, "failed to read related_cpus");
                    continue;
                }
            };
            let cores: Vec<u8> = text
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect();
            if cores.is_empty() {
                continue;
            }
            clusters.push(Cluster {
                physical_id: idx as u8,
                cores,
            });
        }
        if clusters.is_empty() {
            return None;
        }
        debug!(clusters = clusters.len(), "topology read from cpufreq");
        Some(Self { clusters })
    }

    /// One cluster covering every online CPU.
    #[must_use]
    pub fn uniform_fallback(cpu_count: usize) -> Self {
        let cores = (0..cpu_count.min(u8::MAX as usize) as u8).collect();
        Self {
            clusters: vec![Cluster {
                physical_id: 0,
                cores,
            }],
        }
    }

    /// A synthetic topology for tests: one entry per cluster giving its core
    /// count, cores numbered globally in order.
    #[must_use]
    pub fn synthetic(core_counts: &[u8]) -> Self {
        let mut clusters = Vec::with_capacity(core_counts.len());
        let mut next_core = 0u8;
        for (idx, &count) in core_counts.iter().enumerate() {
            clusters.push(Cluster {
                physical_id: idx as u8,
                cores: (next_core..next_core + count).collect(),
            });
            next_core += count;
        }
        Self { clusters }
    }

    /// Number of clusters.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Total number of cores across clusters.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.clusters.iter().map(|c| c.cores.len()).sum()
    }

    /// The clusters, in logical order.
    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Maps a logical cluster id to the physical one.
    #[must_use]
    pub fn physical_cluster(&self, logical_cluster: u8) -> Option<u8> {
        self.clusters
            .get(logical_cluster as usize)
            .map(|c| c.physical_id)
    }

    /// Maps a (logical cluster, logical core) pair to (physical cluster,
    /// global core id). Logical cores count from 1 within their cluster.
    #[must_use]
    pub fn physical_core(&self, logical_cluster: u8, logical_core: u8) -> Option<(u8, u8)> {
        let cluster = self.clusters.get(logical_cluster as usize)?;
        if logical_core == 0 {
            return None;
        }
        let core = *cluster.cores.get(logical_core as usize - 1)?;
        Some((cluster.physical_id, core))
    }
}

fn online_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use restune_config::TargetConfig;
    use std::path::PathBuf;

    #[test]
    fn synthetic_layout_and_mapping() {
        let topology = Topology::synthetic(&[4, 3]);
        assert_eq!(topology.cluster_count(), 2);
        assert_eq!(topology.core_count(), 7);
        assert_eq!(topology.physical_cluster(1), Some(1));
        assert_eq!(topology.physical_core(0, 1), Some((0, 0)));
        assert_eq!(topology.physical_core(1, 3), Some((1, 6)));
        // Logical cores are 1-based.
        assert_eq!(topology.physical_core(0, 0), None);
        // Out of range.
        assert_eq!(topology.physical_core(1, 4), None);
        assert_eq!(topology.physical_core(2, 1), None);
    }

    #[test]
    fn target_override_renumbers_clusters() {
        let yaml = r#"
clusters:
  - logical: 0
    physical: 1
    cores: 2
  - logical: 1
    physical: 0
    cores: 2
"#;
        let target = TargetConfig::from_yaml(yaml, &PathBuf::from("target.yaml")).unwrap();
        let topology = Topology::from_target(&target);
        assert_eq!(topology.physical_cluster(0), Some(1));
        assert_eq!(topology.physical_cluster(1), Some(0));
        assert_eq!(topology.physical_core(1, 2), Some((0, 3)));
    }

    #[test]
    fn cpufreq_scan_reads_related_cpus() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("policy0")).unwrap();
        std::fs::create_dir(dir.path().join("policy4")).unwrap();
        std::fs::write(dir.path().join("policy0/related_cpus"), "0 1 2 3\n").unwrap();
        std::fs::write(dir.path().join("policy4/related_cpus"), "4 5\n").unwrap();

        let topology = Topology::from_cpufreq(dir.path()).unwrap();
        assert_eq!(topology.cluster_count(), 2);
        assert_eq!(topology.clusters()[0].cores, vec![0, 1, 2, 3]);
        assert_eq!(topology.clusters()[1].cores, vec![4, 5]);
    }

    #[test]
    fn cpufreq_scan_fails_without_policies() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Topology::from_cpufreq(dir.path()).is_none());
    }

    #[test]
    fn uniform_fallback_is_one_cluster() {
        let topology = Topology::uniform_fallback(6);
        assert_eq!(topology.cluster_count(), 1);
        assert_eq!(topology.core_count(), 6);
    }
}
