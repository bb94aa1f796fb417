// SPDX-License-Identifier: Apache-2.0

//! Admission: everything that happens to a decoded request before it is
//! queued.
//!
//! Tune requests run the full gauntlet — global gate, client creation, rate
//! limit, verification, duplicate detection — and get their handle here, so
//! the transport can answer the client without waiting for the dispatcher.
//! Retune and untune requests are validated against the owning tune and
//! pre-mark the registry to close the races with an in-flight tune.

use crate::core::Core;
use crate::error::Error;
use crate::message::{Message, UntuneOrigin};
use crate::requests::{ProcessingStatus, Request, RequestRegistry, ResourceRequest};
use crate::resources::TARGET_ALL;
use restune_common::{Handle, RequestProperties, RequestType, TrustLevel, TunePriority};
use restune_config::{ApplyScope, Permission};
use std::sync::Arc;
use tracing::debug;

/// A decoded tune submission, before admission.
#[derive(Debug, Clone)]
pub struct TuneIntent {
    /// Requested duration in milliseconds; −1 means infinite.
    pub duration_ms: i64,
    /// Raw properties word from the wire.
    pub properties: i32,
    /// Submitting process.
    pub pid: i32,
    /// Submitting thread.
    pub tid: i32,
    /// The resources to tune.
    pub resources: Vec<ResourceRequest>,
}

/// Admits a tune request. On success the request is queued and its handle
/// returned; on failure nothing is left behind.
pub fn submit_tune(core: &Core, intent: TuneIntent) -> Result<Handle, Error> {
    core.limiter.check_global_gate()?;

    if !core.clients.exists(intent.pid, intent.tid) {
        core.clients.ensure(intent.pid, intent.tid);
        if !core.clients.exists(intent.pid, intent.tid) {
            return Err(Error::ClientAllocation {
                pid: intent.pid,
                tid: intent.tid,
            });
        }
    }

    core.limiter.check_thread(intent.tid)?;

    let request = verify_tune(core, intent)?;

    let outstanding = core.clients.handles_of(request.tid);
    if core.requests.is_duplicate(&request, &outstanding) {
        debug!(tid = request.tid, "duplicate found, dropping request");
        return Err(Error::Duplicate { tid: request.tid });
    }

    let handle = request.handle;
    let tid = request.tid;
    let request = Arc::new(request);
    RequestRegistry::check_sane(&request)?;
    core.requests.insert(request.clone());
    core.clients.attach_handle(tid, handle);
    core.queue.add_and_wakeup(Message::Tune { request });
    Ok(handle)
}

/// Admits a retune. The duration change is pre-recorded so a retune racing
/// its not-yet-applied tune still takes effect.
pub fn submit_retune(core: &Core, handle: Handle, duration_ms: i64, pid: i32, tid: i32) -> Result<(), Error> {
    if duration_ms == 0 || duration_ms < -1 {
        return Err(Error::MalformedRequest {
            details: format!("invalid duration {duration_ms}"),
        });
    }
    let request = owned_request(core, handle, pid, tid)?;
    core.requests.modify_duration(handle, duration_ms);
    core.queue.add_and_wakeup(Message::Retune {
        handle,
        duration_ms,
        pid,
        priority: request.priority.into(),
    });
    Ok(())
}

/// Admits an untune. The sticky cancel bit is set here, before queueing, so
/// a tune still in the pipeline is dropped when popped.
pub fn submit_untune(core: &Core, handle: Handle, pid: i32, tid: i32) -> Result<(), Error> {
    let request = owned_request(core, handle, pid, tid)?;
    core.limiter.check_thread(tid)?;
    // A tune still in flight through the queue must not apply after its own
    // withdrawal: the sticky bit makes it drop itself when popped. An
    // already-applied tune is torn down by the queued untune instead.
    if core.requests.status_of(handle) != Some(ProcessingStatus::Completed) {
        core.requests.mark_cancelled(handle);
    }
    core.queue.add_and_wakeup(Message::Untune {
        handle,
        pid,
        origin: UntuneOrigin::Client,
        priority: request.priority.into(),
    });
    Ok(())
}

/// Looks up the original tune and enforces client existence and ownership.
fn owned_request(core: &Core, handle: Handle, pid: i32, tid: i32) -> Result<Arc<Request>, Error> {
    if !core.clients.exists(pid, tid) {
        return Err(Error::HandleNotFound { handle });
    }
    let (request, _status) = core
        .requests
        .get(handle)
        .ok_or(Error::HandleNotFound { handle })?;
    if request.pid != pid {
        return Err(Error::ForeignHandle { handle });
    }
    Ok(request)
}

/// Structural and semantic verification of a tune intent, producing the
/// admitted request with its internal priority and physical addressing.
fn verify_tune(core: &Core, intent: TuneIntent) -> Result<Request, Error> {
    if intent.duration_ms == 0 || intent.duration_ms < -1 {
        return Err(Error::MalformedRequest {
            details: format!("invalid duration {}", intent.duration_ms),
        });
    }
    if intent.resources.is_empty() {
        return Err(Error::MalformedRequest {
            details: "no resources to be tuned".to_owned(),
        });
    }
    let properties =
        RequestProperties::from_wire(intent.properties).ok_or_else(|| Error::MalformedRequest {
            details: format!("invalid properties word {:#x}", intent.properties),
        })?;

    let trust = core
        .clients
        .trust_of(intent.pid)
        .ok_or(Error::UnknownTrust { pid: intent.pid })?;
    let priority = TunePriority::derive(trust, properties.priority);

    let mut resources = intent.resources;
    for resource in &mut resources {
        let config = core
            .resources
            .lookup(resource.opcode)
            .ok_or(Error::UnknownOpcode {
                opcode: resource.opcode,
            })?;

        if resource.values.len() == 1 {
            let value = resource.value();
            if value < config.low_threshold || value > config.high_threshold {
                return Err(Error::ValueOutOfBounds {
                    value,
                    low: config.low_threshold,
                    high: config.high_threshold,
                    opcode: resource.opcode,
                });
            }
        }

        if !config.supported {
            return Err(Error::Unsupported {
                opcode: resource.opcode,
            });
        }
        if config.permission == Permission::System && trust == TrustLevel::ThirdParty {
            return Err(Error::InsufficientPermission {
                opcode: resource.opcode,
            });
        }

        // Rewrite logical addressing to physical before the table sees it.
        match config.apply_scope {
            ApplyScope::Cluster => {
                let cluster = resource.info.cluster();
                if cluster != TARGET_ALL {
                    let physical = core
                        .resources
                        .topology()
                        .physical_cluster(cluster)
                        .ok_or(Error::UnknownTopology {
                            cluster,
                            core: resource.info.core(),
                        })?;
                    resource.info = resource.info.with_cluster(physical);
                }
            }
            ApplyScope::Core => {
                let cluster = resource.info.cluster();
                let logical_core = resource.info.core();
                if logical_core != TARGET_ALL {
                    let (physical_cluster, physical_core) = core
                        .resources
                        .topology()
                        .physical_core(cluster, logical_core)
                        .ok_or(Error::UnknownTopology {
                            cluster,
                            core: logical_core,
                        })?;
                    resource.info = resource
                        .info
                        .with_cluster(physical_cluster)
                        .with_core(physical_core);
                }
            }
            ApplyScope::Cgroup => {
                let id = resource.cgroup_id().ok_or_else(|| Error::MalformedRequest {
                    details: "cgroup resource without a cgroup id value".to_owned(),
                })?;
                if !core.resources.cgroups().iter().any(|c| c.id == id) {
                    return Err(Error::UnknownCGroup { id });
                }
            }
            ApplyScope::Global => {}
        }
    }

    Ok(Request {
        kind: RequestType::Tune,
        handle: core.requests.next_handle(),
        duration_ms: intent.duration_ms,
        priority,
        properties,
        pid: intent.pid,
        tid: intent.tid,
        resources,
    })
}

/// Serves a property read, falling back to the caller's default.
#[must_use]
pub fn get_property(core: &Core, key: &str, fallback: &str) -> String {
    core.properties.read().get_or(key, fallback).to_owned()
}

/// Serves a property write. System trust required.
pub fn set_property(core: &Core, key: &str, value: &str, pid: i32) -> Result<(), Error> {
    core.clients.ensure(pid, pid);
    match core.clients.trust_of(pid) {
        Some(TrustLevel::System) => {
            let _ = core.properties.write().set(key, value);
            Ok(())
        }
        Some(TrustLevel::ThirdParty) => Err(Error::PropertyDenied {
            key: key.to_owned(),
        }),
        None => Err(Error::UnknownTrust { pid }),
    }
}
