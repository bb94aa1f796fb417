// SPDX-License-Identifier: Apache-2.0

//! The unix-socket listener.
//!
//! Runs on a dedicated OS thread with a single-threaded async runtime and a
//! local task set; each accepted connection becomes a local task. Shutdown
//! is requested through a cancellation token and completes when the thread
//! is joined.

use crate::error::Error;
use crate::wire::{self, ClientFrame, MAX_FRAME_LEN};
use restune_engine::requests::ResourceRequest;
use restune_engine::{Core, ingress};
use restune_common::{Opcode, ResourceInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to the listener thread.
pub struct ListenerHandle {
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<Result<(), Error>>>,
    socket_path: PathBuf,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl ListenerHandle {
    /// Requests shutdown and joins the listener thread. The socket file is
    /// removed on the way out.
    pub fn shutdown_and_join(mut self) -> Result<(), Error> {
        self.cancel.cancel();
        let result = match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|panic| {
                Err(Error::ConnectionIo {
                    details: format!("listener thread panicked: {panic:?}"),
                })
            }),
            None => Ok(()),
        };
        let _ = std::fs::remove_file(&self.socket_path);
        result
    }
}

/// Spawns the listener thread on `socket_path`. A stale socket file from a
/// previous run is removed before binding.
pub fn spawn_listener(core: Arc<Core>, socket_path: PathBuf) -> Result<ListenerHandle, Error> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let path = socket_path.clone();

    let join = thread::Builder::new()
        .name("restune-listen".to_owned())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|err| Error::Runtime {
                    details: err.to_string(),
                })?;
            let local = LocalSet::new();
            rt.block_on(local.run_until(serve(core, path, token)))
        })
        .map_err(|err| Error::ThreadSpawn {
            details: err.to_string(),
        })?;

    Ok(ListenerHandle {
        cancel,
        join: Some(join),
        socket_path,
    })
}

async fn serve(core: Arc<Core>, path: PathBuf, token: CancellationToken) -> Result<(), Error> {
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener = UnixListener::bind(&path).map_err(|err| Error::Bind {
        path: path.clone(),
        details: err.to_string(),
    })?;
    info!(path = %path.display(), "listener ready");

    loop {
        tokio::select! {
            () = token.cancelled() => {
                info!("listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let core = core.clone();
                        let _task = tokio::task::spawn_local(async move {
                            if let Err(err) = handle_connection(&core, stream).await {
                                debug!(%err, "connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(core: &Core, mut stream: UnixStream) -> Result<(), Error> {
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            // Clean end of stream between frames.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => {
                return Err(Error::ConnectionIo {
                    details: err.to_string(),
                });
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(Error::ConnectionIo {
                details: format!("frame length {len} out of range"),
            });
        }
        let mut body = vec![0u8; len];
        let _ = stream
            .read_exact(&mut body)
            .await
            .map_err(|err| Error::ConnectionIo {
                details: err.to_string(),
            })?;

        let frame = match wire::decode_frame(&body) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "malformed frame, dropping connection");
                return Ok(());
            }
        };
        let response = dispatch(core, frame);
        stream
            .write_all(&response)
            .await
            .map_err(|err| Error::ConnectionIo {
                details: err.to_string(),
            })?;
    }
}

/// Runs admission for one frame and encodes the response bytes.
fn dispatch(core: &Core, frame: ClientFrame) -> Vec<u8> {
    match frame {
        ClientFrame::Tune {
            duration_ms,
            properties,
            pid,
            tid,
            resources,
        } => {
            let intent = ingress::TuneIntent {
                duration_ms,
                properties,
                pid,
                tid,
                resources: resources
                    .into_iter()
                    .map(|r| ResourceRequest {
                        opcode: Opcode::from_raw(r.opcode),
                        info: ResourceInfo::from_raw(r.info),
                        optional_info: r.optional_info,
                        values: r.values,
                    })
                    .collect(),
            };
            let handle = match ingress::submit_tune(core, intent) {
                Ok(handle) => handle,
                Err(err) => {
                    debug!(%err, "tune rejected");
                    -1
                }
            };
            handle.to_le_bytes().to_vec()
        }
        ClientFrame::Retune {
            handle,
            duration_ms,
            pid,
            tid,
        } => {
            let status = match ingress::submit_retune(core, handle, duration_ms, pid, tid) {
                Ok(()) => 0,
                Err(err) => {
                    debug!(%err, "retune rejected");
                    wire::status_code(err.kind())
                }
            };
            vec![status as u8]
        }
        ClientFrame::Untune { handle, pid, tid } => {
            let status = match ingress::submit_untune(core, handle, pid, tid) {
                Ok(()) => 0,
                Err(err) => {
                    debug!(%err, "untune rejected");
                    wire::status_code(err.kind())
                }
            };
            vec![status as u8]
        }
        ClientFrame::PropGet {
            key,
            fallback,
            pid: _,
            tid: _,
        } => {
            let value = ingress::get_property(core, &key, &fallback);
            let mut response = (value.len() as u16).to_le_bytes().to_vec();
            response.extend_from_slice(value.as_bytes());
            response
        }
        ClientFrame::PropSet {
            key,
            value,
            pid,
            tid: _,
        } => {
            let status = match ingress::set_property(core, &key, &value, pid) {
                Ok(()) => 0,
                Err(err) => {
                    debug!(%err, "prop set rejected");
                    wire::status_code(err.kind())
                }
            };
            vec![status as u8]
        }
    }
}
