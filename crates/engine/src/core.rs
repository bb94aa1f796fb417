// SPDX-License-Identifier: Apache-2.0

//! The core context: every shared engine component, built once at startup
//! and passed by reference. There are no process-wide singletons; whoever
//! needs a component gets it from here by construction.

use crate::appliers::ApplierRegistry;
use crate::clients::{ClientRegistry, TrustProbe};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::mode::{ModeController, ModeState};
use crate::queue::OrderedQueue;
use crate::rate_limiter::RateLimiter;
use crate::requests::RequestRegistry;
use crate::resources::ResourceTable;
use crate::sweeper::{HandleGc, PulseMonitor};
use crate::sysfs::DefaultsVault;
use crate::timers::{TimerId, TimerWheel};
use crate::topology::Topology;
use parking_lot::RwLock;
use restune_config::{ConfigSet, Properties, TunerSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Where captured node defaults are persisted between runs.
pub const PERSISTENCE_FILE: &str = "/var/lib/resource-tuner/defaults.sav";

/// Builder for [`Core`], with injection points for tests.
pub struct CoreBuilder {
    config: ConfigSet,
    trust_probe: Option<TrustProbe>,
    vault: Option<Arc<DefaultsVault>>,
    topology: Option<Arc<Topology>>,
}

impl CoreBuilder {
    /// Starts from a parsed configuration set.
    #[must_use]
    pub fn new(config: ConfigSet) -> Self {
        Self {
            config,
            trust_probe: None,
            vault: None,
            topology: None,
        }
    }

    /// Overrides the `/proc` trust probe.
    #[must_use]
    pub fn trust_probe(mut self, probe: TrustProbe) -> Self {
        self.trust_probe = Some(probe);
        self
    }

    /// Overrides the defaults vault (tests use an ephemeral one).
    #[must_use]
    pub fn vault(mut self, vault: Arc<DefaultsVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Overrides topology discovery.
    #[must_use]
    pub fn topology(mut self, topology: Arc<Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Builds the core. Fails on invalid properties or unresolvable applier
    /// bindings; both abort startup.
    pub fn build(self, wheel: TimerWheel) -> Result<Core, Error> {
        let settings = self
            .config
            .properties
            .tuner_settings()
            .map_err(|err| Error::Init {
                details: err.to_string(),
            })?;

        let topology = self
            .topology
            .unwrap_or_else(|| Arc::new(Topology::detect(&self.config.target)));
        info!(
            clusters = topology.cluster_count(),
            cores = topology.core_count(),
            "topology ready"
        );

        let resources = Arc::new(ResourceTable::new(
            self.config.resources,
            topology,
            self.config.init.cgroups,
        ));

        let mut appliers = ApplierRegistry::with_builtins();
        appliers.bind_catalog(resources.catalog_entries())?;
        let appliers = Arc::new(appliers);

        let vault = self
            .vault
            .unwrap_or_else(|| Arc::new(DefaultsVault::new(PathBuf::from(PERSISTENCE_FILE))));

        let clients = Arc::new(match self.trust_probe {
            Some(probe) => ClientRegistry::with_trust_probe(probe),
            None => ClientRegistry::new(),
        });
        let requests = Arc::new(RequestRegistry::new());
        let limiter = Arc::new(RateLimiter::new(
            clients.clone(),
            requests.clone(),
            settings.delta_ms,
            settings.penalty,
            settings.reward,
            settings.max_concurrent_requests,
        ));
        let queue = Arc::new(OrderedQueue::new());
        let mode = Arc::new(ModeState::new());
        let gc = Arc::new(HandleGc::new(
            clients.clone(),
            requests.clone(),
            queue.clone(),
            settings.gc_batch_size,
        ));
        let pulse = Arc::new(PulseMonitor::new(clients.clone(), gc.clone()));
        let properties = Arc::new(RwLock::new(self.config.properties));

        debug!(resources = resources.total_slots(), "core context built");
        Ok(Core {
            settings,
            resources,
            appliers,
            vault,
            clients,
            requests,
            limiter,
            queue,
            mode,
            gc,
            pulse,
            properties,
            wheel,
        })
    }
}

/// The engine context shared by the listener, dispatcher, and daemons.
pub struct Core {
    /// The typed settings snapshot the daemon runs with.
    pub settings: TunerSettings,
    /// Resource catalog plus slot layout.
    pub resources: Arc<ResourceTable>,
    /// Applier / reset callbacks, bound to the catalog.
    pub appliers: Arc<ApplierRegistry>,
    /// Captured node defaults.
    pub vault: Arc<DefaultsVault>,
    /// Client bookkeeping.
    pub clients: Arc<ClientRegistry>,
    /// Outstanding request handles.
    pub requests: Arc<RequestRegistry>,
    /// Admission gates.
    pub limiter: Arc<RateLimiter>,
    /// Ingress → dispatcher queue.
    pub queue: Arc<OrderedQueue>,
    /// Current device mode.
    pub mode: Arc<ModeState>,
    /// Handle garbage collector.
    pub gc: Arc<HandleGc>,
    /// Client liveness monitor.
    pub pulse: Arc<PulseMonitor>,
    /// The live property store served by prop get/set.
    pub properties: Arc<RwLock<Properties>>,
    /// The shared timer wheel.
    pub wheel: TimerWheel,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// A mode controller over this context.
    #[must_use]
    pub fn mode_controller(&self) -> ModeController {
        ModeController::new(
            self.mode.clone(),
            self.requests.clone(),
            self.resources.clone(),
            self.vault.clone(),
            self.queue.clone(),
        )
    }

    /// Arms the periodic liveness and collection daemons on the wheel.
    pub fn start_daemons(&self) -> (TimerId, TimerId) {
        let pulse = self.pulse.clone();
        let pulse_id = self.wheel.arm_periodic(
            Duration::from_millis(self.settings.pulse_duration_ms),
            Arc::new(move || pulse.sweep()),
        );
        let gc = self.gc.clone();
        let gc_id = self.wheel.arm_periodic(
            Duration::from_millis(self.settings.gc_duration_ms),
            Arc::new(move || gc.collect()),
        );
        info!("pulse monitor and garbage collector armed");
        (pulse_id, gc_id)
    }

    /// Spawns the dispatcher on its dedicated thread.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let core = self.clone();
        thread::Builder::new()
            .name("restune-dispatch".to_owned())
            .spawn(move || {
                let mut dispatcher = Dispatcher::new(&core);
                dispatcher.run();
            })
            .expect("failed to spawn dispatcher thread")
    }

    /// Posts the cleanup sentinel; the dispatcher returns after the queue
    /// drains up to it.
    pub fn request_shutdown(&self) {
        self.queue
            .add_and_wakeup(crate::message::Message::ServerCleanup);
    }

    /// Final sweep: every node the daemon ever touched goes back to its
    /// captured default.
    pub fn restore_all_defaults(&self) {
        self.resources.restore_defaults(&self.vault);
    }
}

/// Replays and deletes the persistence file from a previous crashed run.
/// Call before building the core so fresh captures start clean.
pub fn restore_safe_state_from(persistence: &Path) {
    crate::sysfs::restore_safe_state(persistence);
}
