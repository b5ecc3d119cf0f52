// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Periodic, coalesced `connect`/`update` reconciliation of per-object state
//! across a container's peers, multiplexed over a single signal stream.
//!
//! One [`ContainerSynchronizer`] exists per container-runtime identity,
//! reference-counted in a process-wide registry and disposed on last
//! release -- the same shape `net::gossip`'s per-peer bookkeeping takes in
//! the teacher. Per-tick key snapshots and per-id panic isolation via
//! `tokio::spawn`/`JoinError` mirror `net::protocol::tick::tock` and
//! `executor::Spawner` respectively.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    error::Error,
    signal::{ClientId, ContainerRuntimeSignaler, InboundSignalMessage},
    telemetry::{HandlerPhase, TelemetryEvent, TelemetrySink},
};

/// The object-type check spec §9's Open Question calls for: a record is a
/// JSON object; anything else (null, a primitive, an array) is skipped.
fn is_record(value: &serde_json::Value) -> bool {
    value.is_object()
}

/// An application-owned entity whose state is kept in sync across peers.
#[async_trait]
pub trait SyncObject: Send + Sync {
    /// `connecting` is true when this call is serving a `connect` burst
    /// (initial or pong), false for a periodic `update` tick. `None` omits
    /// this object from the outgoing signal entirely.
    async fn get_state(&self, connecting: bool) -> Option<serde_json::Value>;

    /// Applies state received from `sender_id`. `connecting` mirrors the
    /// signal type that carried it (`connect` vs `update`).
    async fn apply_remote_state(&self, connecting: bool, state: serde_json::Value, sender_id: ClientId);
}

/// Opaque identity of a container-runtime, used to key the process-wide
/// registry of [`ContainerSynchronizer`]s.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

const DEFAULT_UPDATE_INTERVAL_MS: u64 = 5000;

lazy_static! {
    static ref DEFAULT_UPDATE_INTERVAL: AtomicU64 = AtomicU64::new(DEFAULT_UPDATE_INTERVAL_MS);
}

/// Sets the process-global default `updateInterval` used by every
/// [`ContainerSynchronizer`] created after this call. Has no effect on
/// already-running synchronizers.
pub fn set_default_update_interval(interval: Duration) {
    DEFAULT_UPDATE_INTERVAL.store(interval.as_millis() as u64, Ordering::SeqCst);
}

fn default_update_interval() -> Duration {
    Duration::from_millis(DEFAULT_UPDATE_INTERVAL.load(Ordering::SeqCst))
}

struct RegistryEntry {
    synchronizer: Arc<ContainerSynchronizer>,
    refcount: usize,
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<ContainerId, RegistryEntry>> = Mutex::new(HashMap::new());
}

fn acquire(
    container_id: ContainerId,
    runtime: Arc<dyn ContainerRuntimeSignaler>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Arc<ContainerSynchronizer> {
    let mut registry = REGISTRY.lock();
    if let Some(entry) = registry.get_mut(&container_id) {
        entry.refcount += 1;
        return Arc::clone(&entry.synchronizer);
    }
    let synchronizer = Arc::new(ContainerSynchronizer::new(runtime, telemetry, default_update_interval()));
    synchronizer.start_timer();
    registry.insert(
        container_id,
        RegistryEntry {
            synchronizer: Arc::clone(&synchronizer),
            refcount: 1,
        },
    );
    synchronizer
}

fn release(container_id: &ContainerId) {
    let mut registry = REGISTRY.lock();
    if let Some(entry) = registry.get_mut(container_id) {
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entry.synchronizer.stop_timer();
            registry.remove(container_id);
        }
    }
}

#[cfg(test)]
fn registered_container_count() -> usize {
    REGISTRY.lock().len()
}

/// One per container-runtime identity. Multiplexes every registered
/// [`SyncObject`] over a single `ContainerRuntimeSignaler`.
pub struct ContainerSynchronizer {
    runtime: Arc<dyn ContainerRuntimeSignaler>,
    telemetry: Arc<dyn TelemetrySink>,
    objects: DashMap<String, Arc<dyn SyncObject>>,
    connected_keys: Mutex<HashSet<String>>,
    unconnected_keys: Mutex<HashSet<String>>,
    /// Set by [`Self::handle_runtime_connected`]; there is no `connected`
    /// field on `ContainerRuntimeSignaler` itself, so this is the
    /// synchronizer's own record of whether the carrier has announced it.
    connected: AtomicBool,
    update_interval: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Ids registered while connected, awaiting the next coalescing flush.
    /// Registrations that happen synchronously back to back (e.g. a caller
    /// constructing several facades in a row) accumulate here and go out as
    /// one `connect` signal instead of one per id.
    pending_connect: Mutex<HashSet<String>>,
    connect_flush_scheduled: AtomicBool,
}

impl ContainerSynchronizer {
    fn new(runtime: Arc<dyn ContainerRuntimeSignaler>, telemetry: Arc<dyn TelemetrySink>, update_interval: Duration) -> Self {
        Self {
            runtime,
            telemetry,
            objects: DashMap::new(),
            connected_keys: Mutex::new(HashSet::new()),
            unconnected_keys: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            update_interval,
            timer: Mutex::new(None),
            pending_connect: Mutex::new(HashSet::new()),
            connect_flush_scheduled: AtomicBool::new(false),
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = self.update_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; consume it so the first update waits a full interval
            loop {
                ticker.tick().await;
                this.tick().await;
            }
        });
        *self.timer.lock() = Some(handle);
    }

    fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    /// Registers `object` under `id`. Synchronous, so `DuplicateRegistration`
    /// is raised at the call site rather than surfacing later.
    fn register(self: &Arc<Self>, id: String, object: Arc<dyn SyncObject>) -> Result<(), Error> {
        match self.objects.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateRegistration(id)),
            Entry::Vacant(v) => {
                v.insert(object.clone());
            },
        }

        if self.connected.load(Ordering::SeqCst) {
            self.connected_keys.lock().insert(id.clone());
            self.pending_connect.lock().insert(id);
            self.schedule_connect_flush();
        } else {
            self.unconnected_keys.lock().insert(id);
        }
        Ok(())
    }

    /// Ensures exactly one flush of `pending_connect` is in flight. A
    /// registration that finds a flush already scheduled just adds its id to
    /// the pending set and returns -- the in-flight flush will pick it up if
    /// it hasn't drained yet, or the next `schedule_connect_flush` call will.
    fn schedule_connect_flush(self: &Arc<Self>) {
        if self.connect_flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let ids: Vec<String> = this.pending_connect.lock().drain().collect();
            this.connect_flush_scheduled.store(false, Ordering::SeqCst);
            this.emit_coalesced("connect", ids, true).await;
        });
    }

    fn unregister(&self, id: &str) {
        self.objects.remove(id);
        self.connected_keys.lock().remove(id);
        self.unconnected_keys.lock().remove(id);
    }

    /// Call from the host's `on("connected", ..)` handler. Flushes any
    /// objects registered while disconnected into a single coalesced
    /// `connect` burst.
    pub fn handle_runtime_connected(self: &Arc<Self>) {
        self.connected.store(true, Ordering::SeqCst);
        let pending: Vec<String> = {
            let mut unconnected = self.unconnected_keys.lock();
            if unconnected.is_empty() {
                return;
            }
            unconnected.drain().collect()
        };
        self.connected_keys.lock().extend(pending.iter().cloned());

        let this = Arc::clone(self);
        tokio::spawn(async move { this.emit_coalesced("connect", pending, true).await });
    }

    /// Call from the host's `on("signal", ..)` handler for this container.
    #[tracing::instrument(skip(self, message))]
    pub fn handle_signal(self: &Arc<Self>, message: InboundSignalMessage, local: bool) {
        if local {
            return;
        }
        if message.signal_type != "connect" && message.signal_type != "update" {
            return;
        }
        let sender = match message.client_id.clone() {
            Some(id) => id,
            None => return,
        };
        let payload = match message.content {
            serde_json::Value::Object(map) => map,
            _ => return,
        };
        let connecting = message.signal_type == "connect";
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_inbound(payload, connecting, sender).await });
    }

    async fn dispatch_inbound(
        self: &Arc<Self>,
        payload: serde_json::Map<String, serde_json::Value>,
        connecting: bool,
        sender_id: ClientId,
    ) {
        let mut recognized = Vec::new();
        for (id, state) in payload {
            if !is_record(&state) {
                continue;
            }
            let object = match self.objects.get(&id) {
                Some(o) => Arc::clone(o.value()),
                None => continue,
            };
            recognized.push(id.clone());

            let sender_id = sender_id.clone();
            let join = tokio::spawn(async move { object.apply_remote_state(connecting, state, sender_id).await });
            if let Err(join_err) = join.await {
                self.telemetry.report(TelemetryEvent::HandlerFailure {
                    object_id: id,
                    phase: HandlerPhase::ApplyRemoteState,
                    reason: join_err.to_string(),
                });
            }
        }

        // The pong: a connect gets exactly one immediate update in reply,
        // covering only the ids this side actually recognized.
        if connecting && !recognized.is_empty() {
            self.emit_coalesced("update", recognized, false).await;
        }
    }

    #[tracing::instrument(skip(self))]
    async fn tick(self: &Arc<Self>) {
        let ids: Vec<String> = self.connected_keys.lock().iter().cloned().collect();
        self.emit_coalesced("update", ids, false).await;
    }

    /// Gathers `get_state(connecting)` for each of `ids`, isolating panics
    /// per id, and submits a single signal of `signal_type` if any state
    /// came back non-empty. A panicking `getState` is logged and that id is
    /// simply omitted; the rest proceed.
    async fn emit_coalesced(self: &Arc<Self>, signal_type: &'static str, ids: Vec<String>, connecting: bool) {
        let mut payload = serde_json::Map::new();
        for id in ids {
            let object = match self.objects.get(&id) {
                Some(o) => Arc::clone(o.value()),
                None => continue,
            };
            match tokio::spawn(async move { object.get_state(connecting).await }).await {
                Ok(Some(state)) => {
                    payload.insert(id, state);
                },
                Ok(None) => {},
                Err(join_err) => {
                    self.telemetry.report(TelemetryEvent::HandlerFailure {
                        object_id: id,
                        phase: HandlerPhase::GetState,
                        reason: join_err.to_string(),
                    });
                },
            }
        }
        if !payload.is_empty() {
            self.runtime.submit_signal(signal_type, serde_json::Value::Object(payload));
        }
    }
}

/// Per-object handle returned to application code. Registers on
/// construction, unregisters idempotently on [`Self::dispose`] or drop.
pub struct ObjectSynchronizerFacade {
    container_id: ContainerId,
    object_id: String,
    synchronizer: Arc<ContainerSynchronizer>,
    disposed: AtomicBool,
}

impl ObjectSynchronizerFacade {
    pub fn new(
        container_id: impl Into<ContainerId>,
        object_id: impl Into<String>,
        runtime: Arc<dyn ContainerRuntimeSignaler>,
        telemetry: Arc<dyn TelemetrySink>,
        object: Arc<dyn SyncObject>,
    ) -> Result<Self, Error> {
        let container_id = container_id.into();
        let object_id = object_id.into();
        let synchronizer = acquire(container_id.clone(), runtime, telemetry);

        if let Err(err) = synchronizer.register(object_id.clone(), object) {
            release(&container_id);
            return Err(err);
        }

        Ok(Self {
            container_id,
            object_id,
            synchronizer,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Forwards to the shared [`ContainerSynchronizer`] for this container.
    /// Any facade registered against the same container reaches the same
    /// synchronizer, so the host only needs to call this from *one* of its
    /// facades' surrounding code (typically the one it considers the
    /// container's "owner"), not once per object.
    pub fn handle_runtime_connected(&self) {
        self.synchronizer.handle_runtime_connected();
    }

    /// Forwards an inbound `connect`/`update` signal to the shared
    /// [`ContainerSynchronizer`] for this container.
    pub fn handle_signal(&self, message: InboundSignalMessage, local: bool) {
        self.synchronizer.handle_signal(message, local);
    }

    /// Idempotent: safe to call more than once, and safe to let drop do it
    /// instead.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.synchronizer.unregister(&self.object_id);
        release(&self.container_id);
    }
}

impl Drop for ObjectSynchronizerFacade {
    fn drop(&mut self) {
        self.dispose();
    }
}
