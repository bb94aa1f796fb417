// SPDX-License-Identifier: Apache-2.0

//! Shared harness for the end-to-end engine tests: a full core over
//! tempfile-backed tunable nodes, with the dispatcher driven inline so every
//! step is deterministic.

use restune_common::{Handle, Mode, RequestPriority, RequestProperties};
use restune_config::{ConfigSet, InitConfig, Properties, ResourceCatalog, TargetConfig};
use restune_engine::clients::TrustProbe;
use restune_engine::dispatcher::Dispatcher;
use restune_engine::error::Error;
use restune_engine::ingress::{self, TuneIntent};
use restune_engine::requests::ResourceRequest;
use restune_engine::sysfs::DefaultsVault;
use restune_engine::timers::TimerWheel;
use restune_engine::topology::Topology;
use restune_engine::{Core, CoreBuilder};
use restune_common::{Opcode, ResourceInfo, TrustLevel};
use std::path::PathBuf;
use std::sync::Arc;

/// Opcode of the global higher-is-better node.
pub const HIB: u32 = 0x0004_0000;
/// Opcodes of three independent instant-apply nodes.
pub const KNOB_A: u32 = 0x0004_0001;
/// Second instant-apply node.
pub const KNOB_B: u32 = 0x0004_0002;
/// Third instant-apply node.
pub const KNOB_C: u32 = 0x0004_0003;
/// Opcode of the system-permission node.
pub const PRIVILEGED: u32 = 0x0004_0004;

/// Pids at or above this resolve to third-party trust in the test probe.
pub const THIRD_PARTY_PID_BASE: i32 = 9_000;

/// Initial content of every test node.
pub const DEFAULT_VALUE: &str = "1500";

/// A complete engine over temp-backed nodes.
pub struct TestDaemon {
    dir: tempfile::TempDir,
    /// The shared core context.
    pub core: Arc<Core>,
    /// The inline dispatcher.
    pub dispatcher: Dispatcher,
    wheel: TimerWheel,
    wheel_join: Option<std::thread::JoinHandle<()>>,
}

impl TestDaemon {
    /// Builds the daemon with four-node catalog, synthetic topology, and a
    /// trust probe keyed on the pid range.
    pub fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for node in ["hib", "knob_a", "knob_b", "knob_c", "privileged"] {
            std::fs::write(dir.path().join(node), DEFAULT_VALUE).unwrap();
        }
        let base = dir.path().display();
        let resources_yaml = format!(
            r#"
resources:
  - name: hib_node
    path: "{base}/hib"
    opcode: "{HIB:#010x}"
    low_threshold: 0
    high_threshold: 4096
    policy: higher_is_better
    modes: [resume, doze]
  - name: knob_a
    path: "{base}/knob_a"
    opcode: "{KNOB_A:#010x}"
    modes: [resume, suspend, doze]
  - name: knob_b
    path: "{base}/knob_b"
    opcode: "{KNOB_B:#010x}"
    modes: [resume, suspend, doze]
  - name: knob_c
    path: "{base}/knob_c"
    opcode: "{KNOB_C:#010x}"
    modes: [resume, suspend, doze]
  - name: privileged_node
    path: "{base}/privileged"
    opcode: "{PRIVILEGED:#010x}"
    permission: system
"#
        );
        let properties_yaml = r#"
properties:
  restune.delta.ms: "0"
  restune.max.concurrent.requests: "32"
  restune.gc.batch.size: "16"
"#;
        let config = ConfigSet {
            resources: ResourceCatalog::from_common_yaml(
                &resources_yaml,
                &PathBuf::from("resources.yaml"),
            )
            .unwrap(),
            properties: Properties::from_yaml(
                properties_yaml,
                &PathBuf::from("properties.yaml"),
            )
            .unwrap(),
            init: InitConfig::default(),
            target: TargetConfig::default(),
        };

        let probe: TrustProbe = Arc::new(|pid| {
            Some(if pid >= THIRD_PARTY_PID_BASE {
                TrustLevel::ThirdParty
            } else {
                TrustLevel::System
            })
        });

        let (wheel, wheel_join) = TimerWheel::spawn();
        let core = Arc::new(
            CoreBuilder::new(config)
                .trust_probe(probe)
                .vault(Arc::new(DefaultsVault::ephemeral()))
                .topology(Arc::new(Topology::synthetic(&[2, 2])))
                .build(wheel.clone())
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(&core);
        Self {
            dir,
            core,
            dispatcher,
            wheel,
            wheel_join: Some(wheel_join),
        }
    }

    /// Submits a tune and returns the handle from admission.
    pub fn tune(
        &self,
        pid: i32,
        tid: i32,
        opcode: u32,
        value: i32,
        duration_ms: i64,
        priority: RequestPriority,
        modes: Mode,
    ) -> Result<Handle, Error> {
        let properties = RequestProperties { priority, modes }.as_wire();
        ingress::submit_tune(
            &self.core,
            TuneIntent {
                duration_ms,
                properties,
                pid,
                tid,
                resources: vec![ResourceRequest {
                    opcode: Opcode::from_raw(opcode),
                    info: ResourceInfo::default(),
                    optional_info: 0,
                    values: vec![value],
                }],
            },
        )
    }

    /// Submits an untune.
    pub fn untune(&self, handle: Handle, pid: i32, tid: i32) -> Result<(), Error> {
        ingress::submit_untune(&self.core, handle, pid, tid)
    }

    /// Submits a retune.
    pub fn retune(&self, handle: Handle, duration_ms: i64, pid: i32, tid: i32) -> Result<(), Error> {
        ingress::submit_retune(&self.core, handle, duration_ms, pid, tid)
    }

    /// Drains the queue inline.
    pub fn drain(&mut self) {
        let _ = self.dispatcher.drain();
    }

    /// Current content of a test node.
    pub fn node(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.wheel.shutdown();
        if let Some(join) = self.wheel_join.take() {
            let _ = join.join();
        }
    }
}
