// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The raw signaling primitives this crate is layered on top of.
//!
//! These are capability traits: the host application implements them on top
//! of whatever collaboration runtime it embeds, and drives this crate by
//! calling [`crate::event_scope::EventScope::handle_inbound`],
//! [`crate::synchronizer::ObjectSynchronizerFacade::handle_signal`] and
//! [`crate::synchronizer::ObjectSynchronizerFacade::handle_runtime_connected`]
//! from its own `on("signal", ..)` / `on("connected", ..)` handlers. Nothing
//! in this crate blocks on delivery: `submit_signal` is fire-and-forget.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// An opaque, per-connection identifier assigned by the carrier.
///
/// Unique among currently-connected peers; not stable across reconnects.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A session-consistent millisecond timestamp.
///
/// Not assumed to be a real wall clock: only that every client in a session
/// draws from the same reference, which is all the [Freshness
/// Rule][crate::freshness] needs.
pub type Timestamp = i64;

/// The wire envelope for an Event Scope broadcast.
///
/// `client_id` is only ever trustworthy once it has passed through the
/// inbound pipeline, which overwrites it with the carrier-supplied id --
/// never trust a `client_id` read off a [`LiveEvent`] that didn't come from
/// there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub name: String,
    pub client_id: Option<ClientId>,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// The envelope the carrier hands us for every inbound signal, for both the
/// Event Scope (`name`-keyed) and Object Synchronizer (`connect`/`update`)
/// layers -- both ride the same `submitSignal(type, content)` primitive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundSignalMessage {
    pub signal_type: String,
    pub client_id: Option<ClientId>,
    pub content: serde_json::Value,
}

/// A client-scoped view onto the carrier: connection state, local identity,
/// and the ability to submit a signal.
pub trait RuntimeSignaler: Send + Sync {
    /// `None` while disconnected.
    fn client_id(&self) -> Option<ClientId>;

    fn connected(&self) -> bool;

    /// Best-effort, fire-and-forget submission.
    fn submit_signal(&self, signal_type: &str, content: serde_json::Value);
}

/// A container-scoped view onto the carrier, used by the Object Synchronizer
/// to multiplex all live objects in one container over a single stream.
pub trait ContainerRuntimeSignaler: Send + Sync {
    fn submit_signal(&self, signal_type: &str, content: serde_json::Value);
}

/// Supplies the session-consistent clock used to stamp outgoing
/// [`LiveEvent`]s.
pub trait TimestampSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The default [`TimestampSource`], backed by the system clock.
///
/// This is a convenience, not a requirement: the Freshness Rule only needs a
/// shared reference, which `SystemTime` provides as long as all clients in a
/// session have roughly synchronized clocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimestampSource;

impl TimestampSource for SystemTimestampSource {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}
