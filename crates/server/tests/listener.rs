// SPDX-License-Identifier: Apache-2.0

//! Socket-level tests: a real listener, a real dispatcher, framed bytes in,
//! framed bytes out.

use pretty_assertions::assert_eq;
use restune_config::{ConfigSet, InitConfig, Properties, ResourceCatalog, TargetConfig};
use restune_engine::sysfs::DefaultsVault;
use restune_engine::timers::TimerWheel;
use restune_engine::topology::Topology;
use restune_engine::{Core, CoreBuilder};
use restune_common::TrustLevel;
use restune_server::spawn_listener;
use restune_server::wire::{ClientFrame, WireResource, encode_frame};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const KNOB: u32 = 0x0004_0000;

struct SocketHarness {
    dir: tempfile::TempDir,
    core: Arc<Core>,
    wheel: TimerWheel,
    wheel_join: Option<std::thread::JoinHandle<()>>,
    dispatcher_join: Option<std::thread::JoinHandle<()>>,
    listener: Option<restune_server::ListenerHandle>,
    socket: PathBuf,
}

impl SocketHarness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("knob"), "1500").unwrap();
        let resources_yaml = format!(
            r#"
resources:
  - name: knob
    path: "{}/knob"
    opcode: "{KNOB:#010x}"
    low_threshold: 0
    high_threshold: 4096
"#,
            dir.path().display()
        );
        let config = ConfigSet {
            resources: ResourceCatalog::from_common_yaml(
                &resources_yaml,
                &PathBuf::from("resources.yaml"),
            )
            .unwrap(),
            properties: Properties::from_yaml(
                "properties:\n  restune.delta.ms: \"0\"\n",
                &PathBuf::from("properties.yaml"),
            )
            .unwrap(),
            init: InitConfig::default(),
            target: TargetConfig::default(),
        };

        let (wheel, wheel_join) = TimerWheel::spawn();
        let core = Arc::new(
            CoreBuilder::new(config)
                .trust_probe(Arc::new(|_| Some(TrustLevel::System)))
                .vault(Arc::new(DefaultsVault::ephemeral()))
                .topology(Arc::new(Topology::synthetic(&[2])))
                .build(wheel.clone())
                .unwrap(),
        );
        let dispatcher_join = core.spawn_dispatcher();
        let socket = dir.path().join("restune.sock");
        let listener = spawn_listener(core.clone(), socket.clone()).unwrap();

        // Wait for the socket file to appear.
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Self {
            dir,
            core,
            wheel,
            wheel_join: Some(wheel_join),
            dispatcher_join: Some(dispatcher_join),
            listener: Some(listener),
            socket,
        }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket).unwrap()
    }

    fn send(stream: &mut UnixStream, frame: &ClientFrame) {
        let body = encode_frame(frame);
        stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .unwrap();
        stream.write_all(&body).unwrap();
    }

    fn read_i64(stream: &mut UnixStream) -> i64 {
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).unwrap();
        i64::from_le_bytes(buf)
    }

    fn read_status(stream: &mut UnixStream) -> i8 {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).unwrap();
        buf[0] as i8
    }

    fn node(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("knob")).unwrap()
    }

    /// Polls until the dispatcher thread has acted.
    fn await_node(&self, expected: &str) {
        for _ in 0..200 {
            if self.node() == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("node never reached `{expected}`, last value `{}`", self.node());
    }
}

impl Drop for SocketHarness {
    fn drop(&mut self) {
        self.core.request_shutdown();
        if let Some(listener) = self.listener.take() {
            let _ = listener.shutdown_and_join();
        }
        if let Some(join) = self.dispatcher_join.take() {
            let _ = join.join();
        }
        self.wheel.shutdown();
        if let Some(join) = self.wheel_join.take() {
            let _ = join.join();
        }
    }
}

#[test]
fn tune_and_untune_over_the_socket() {
    let harness = SocketHarness::start();
    let mut stream = harness.connect();

    SocketHarness::send(
        &mut stream,
        &ClientFrame::Tune {
            duration_ms: -1,
            properties: 0x0100,
            pid: 100,
            tid: 101,
            resources: vec![WireResource {
                opcode: KNOB,
                info: 0,
                optional_info: 0,
                values: vec![3000],
            }],
        },
    );
    let handle = SocketHarness::read_i64(&mut stream);
    assert!(handle > 0);
    harness.await_node("3000");

    SocketHarness::send(
        &mut stream,
        &ClientFrame::Untune {
            handle,
            pid: 100,
            tid: 101,
        },
    );
    assert_eq!(SocketHarness::read_status(&mut stream), 0);
    harness.await_node("1500");
}

#[test]
fn rejected_tune_returns_negative_handle() {
    let harness = SocketHarness::start();
    let mut stream = harness.connect();

    // Value above the threshold.
    SocketHarness::send(
        &mut stream,
        &ClientFrame::Tune {
            duration_ms: -1,
            properties: 0x0100,
            pid: 100,
            tid: 101,
            resources: vec![WireResource {
                opcode: KNOB,
                info: 0,
                optional_info: 0,
                values: vec![9999],
            }],
        },
    );
    assert_eq!(SocketHarness::read_i64(&mut stream), -1);
    assert_eq!(harness.node(), "1500");
}

#[test]
fn untune_of_unknown_handle_reports_not_found() {
    let harness = SocketHarness::start();
    let mut stream = harness.connect();
    SocketHarness::send(
        &mut stream,
        &ClientFrame::Untune {
            handle: 777,
            pid: 100,
            tid: 101,
        },
    );
    // not_found status code.
    assert_eq!(SocketHarness::read_status(&mut stream), 3);
}

#[test]
fn properties_round_trip_over_the_socket() {
    let harness = SocketHarness::start();
    let mut stream = harness.connect();

    SocketHarness::send(
        &mut stream,
        &ClientFrame::PropSet {
            key: "restune.test.key".to_owned(),
            value: "42".to_owned(),
            pid: 100,
            tid: 101,
        },
    );
    assert_eq!(SocketHarness::read_status(&mut stream), 0);

    SocketHarness::send(
        &mut stream,
        &ClientFrame::PropGet {
            key: "restune.test.key".to_owned(),
            fallback: "none".to_owned(),
            pid: 100,
            tid: 101,
        },
    );
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).unwrap();
    let mut value = vec![0u8; u16::from_le_bytes(len) as usize];
    stream.read_exact(&mut value).unwrap();
    assert_eq!(String::from_utf8(value).unwrap(), "42");

    SocketHarness::send(
        &mut stream,
        &ClientFrame::PropGet {
            key: "restune.unset.key".to_owned(),
            fallback: "fallback".to_owned(),
            pid: 100,
            tid: 101,
        },
    );
    stream.read_exact(&mut len).unwrap();
    let mut value = vec![0u8; u16::from_le_bytes(len) as usize];
    stream.read_exact(&mut value).unwrap();
    assert_eq!(String::from_utf8(value).unwrap(), "fallback");
}
