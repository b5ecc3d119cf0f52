// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Live collaboration synchronization core.
//!
//! Two subsystems, layered on a raw signaling primitive the host supplies:
//!
//! - [`event_scope`] -- a named, role-filtered broadcast channel.
//! - [`synchronizer`] -- a periodic, coalesced `connect`/`update` protocol
//!   that reconciles per-object state across a container's peers.
//!
//! Neither owns the transport: the host implements [`signal::RuntimeSignaler`]
//! / [`signal::ContainerRuntimeSignaler`] on top of its own carrier and
//! drives this crate by calling [`event_scope::EventScope::handle_inbound`],
//! [`synchronizer::ObjectSynchronizerFacade::handle_signal`] and
//! [`synchronizer::ObjectSynchronizerFacade::handle_runtime_connected`] from
//! its own event handlers.

pub mod error;
pub mod event_scope;
pub mod freshness;
pub mod role;
pub mod signal;
pub mod synchronizer;
pub mod telemetry;

pub use error::Error;
pub use event_scope::{EventScope, ListenerId};
pub use freshness::{newer, newer_event, FreshnessKey};
pub use role::{Role, RoleLookup, RoleLookupError, RoleSet, RoleVerifier};
pub use signal::{
    ClientId, ContainerRuntimeSignaler, InboundSignalMessage, LiveEvent, RuntimeSignaler, SystemTimestampSource,
    Timestamp, TimestampSource,
};
pub use synchronizer::{
    set_default_update_interval, ContainerId, ContainerSynchronizer, ObjectSynchronizerFacade, SyncObject,
};
pub use telemetry::{HandlerPhase, TelemetryEvent, TelemetrySink, TracingSink};
