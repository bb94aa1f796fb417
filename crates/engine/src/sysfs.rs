// SPDX-License-Identifier: Apache-2.0

//! Sysfs node IO and the captured-defaults vault.
//!
//! The vault remembers, per expanded node path, the value the node held
//! before the daemon first wrote it. Each capture is also appended to a
//! best-effort persistence file so a crashed daemon can restore dirty nodes
//! on its next start. The persistence file is deleted once replayed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes a value to a tunable node.
pub fn write_node(path: &str, value: &str) -> io::Result<()> {
    std::fs::write(path, value)
}

/// Reads and trims the current value of a tunable node.
pub fn read_node(path: &str) -> io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_owned())
}

/// Expands a resource path format string. `%d` takes the instance number,
/// `%s` the instance name; a format with neither is returned as-is.
#[must_use]
pub fn expand_path(format: &str, index: Option<u32>, name: Option<&str>) -> String {
    let mut path = format.to_owned();
    if let Some(index) = index {
        path = path.replacen("%d", &index.to_string(), 1);
    }
    if let Some(name) = name {
        path = path.replacen("%s", name, 1);
    }
    path
}

/// Per-path defaults captured before the first apply, with the persistence
/// side channel.
#[derive(Debug)]
pub struct DefaultsVault {
    captured: Mutex<HashMap<String, String>>,
    persistence: Option<PathBuf>,
}

impl DefaultsVault {
    /// A vault persisting captures to `path`.
    #[must_use]
    pub fn new(persistence: PathBuf) -> Self {
        Self {
            captured: Mutex::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    /// A vault without the persistence side channel, for tests.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            captured: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    /// Returns the default for `path`, capturing it from the node on first
    /// sight. A node that cannot be read yields `None` and is not captured.
    pub fn capture_if_absent(&self, path: &str) -> Option<String> {
        let mut captured = self.captured.lock();
        if let Some(existing) = captured.get(path) {
            return Some(existing.clone());
        }
        match read_node(path) {
            Ok(value) => {
                let _ = captured.insert(path.to_owned(), value.clone());
                drop(captured);
                self.persist_line(path, &value);
                Some(value)
            }
            Err(err) => {
                warn!(path, %err, "could not capture default value");
                None
            }
        }
    }

    /// Stores an explicit default without touching the node, used when the
    /// config pins one or a callback computes it.
    pub fn store(&self, path: &str, value: &str) {
        let previously_absent = {
            let mut captured = self.captured.lock();
            captured
                .insert(path.to_owned(), value.to_owned())
                .is_none()
        };
        if previously_absent {
            self.persist_line(path, value);
        }
    }

    /// The captured default for `path`, if any.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<String> {
        self.captured.lock().get(path).cloned()
    }

    /// Snapshot of every captured (path, default) pair.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.captured
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn persist_line(&self, path: &str, value: &str) {
        let Some(file) = &self.persistence else {
            return;
        };
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .and_then(|mut f| writeln!(f, "{path},{value}"));
        if let Err(err) = result {
            warn!(file = %file.display(), %err, "could not persist default value");
        }
    }
}

/// Replays a persistence file left over by a crashed run: writes each
/// recorded default back to its node, then deletes the file. Missing file is
/// a no-op.
pub fn restore_safe_state(persistence: &Path) {
    let text = match std::fs::read_to_string(persistence) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(file = %persistence.display(), %err, "could not read persistence file");
            return;
        }
    };
    for line in text.lines() {
        let Some((path, value)) = line.split_once(',') else {
            continue;
        };
        if let Err(err) = write_node(path, value) {
            warn!(path, %err, "could not restore node default");
        } else {
            debug!(path, value, "restored node left dirty by previous run");
        }
    }
    if let Err(err) = std::fs::remove_file(persistence) {
        warn!(file = %persistence.display(), %err, "could not delete persistence file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn expansion_substitutes_one_placeholder() {
        assert_eq!(
            expand_path("/sys/cpufreq/policy%d/max", Some(4), None),
            "/sys/cpufreq/policy4/max"
        );
        assert_eq!(
            expand_path("/sys/fs/cgroup/%s/cgroup.procs", None, Some("background")),
            "/sys/fs/cgroup/background/cgroup.procs"
        );
        assert_eq!(expand_path("/proc/sys/kernel/knob", None, None), "/proc/sys/kernel/knob");
    }

    #[test]
    fn capture_reads_once_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, "1200\n").unwrap();
        let node = node.to_string_lossy().into_owned();

        let vault = DefaultsVault::ephemeral();
        assert_eq!(vault.capture_if_absent(&node), Some("1200".to_owned()));

        // Later node changes do not disturb the captured default.
        std::fs::write(&node, "9999").unwrap();
        assert_eq!(vault.capture_if_absent(&node), Some("1200".to_owned()));
        assert_eq!(vault.get(&node), Some("1200".to_owned()));
    }

    #[test]
    fn unreadable_node_is_not_captured() {
        let vault = DefaultsVault::ephemeral();
        assert_eq!(vault.capture_if_absent("/nonexistent/node"), None);
        assert_eq!(vault.get("/nonexistent/node"), None);
    }

    #[test]
    fn persistence_restores_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("node");
        std::fs::write(&node, "tampered").unwrap();
        let node_str = node.to_string_lossy().into_owned();

        let persistence = dir.path().join("defaults.txt");
        let vault = DefaultsVault::new(persistence.clone());
        vault.store(&node_str, "original");

        restore_safe_state(&persistence);
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "original");
        assert!(!persistence.exists());

        // Second replay is a no-op.
        restore_safe_state(&persistence);
    }
}
