// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Structured diagnostics for errors that are caught and isolated rather
//! than propagated: role rejections, handler panics, role-lookup failures.
//!
//! Every caught failure is both logged via `tracing` *and* forwarded to the
//! configured [`TelemetrySink`], the same dual reporting
//! `net::peer::PeerStorage::put` does in the teacher (a `tracing::error!`
//! alongside a `Fanout` emission).

use crate::signal::ClientId;

/// Which callback on a registered object failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerPhase {
    GetState,
    ApplyRemoteState,
}

/// A structured diagnostic event. The stable `event_name()` matches the
/// names spec.md calls out directly (e.g. `SharedEvent:invalidRole`).
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// An inbound Event Scope signal was dropped because the sender's roles
    /// didn't intersect the scope's `allowedRoles`.
    InvalidRole {
        event_name: String,
        client_id: ClientId,
    },
    /// The Role Verifier failed to resolve a client's roles.
    RoleLookupFailure { client_id: ClientId, reason: String },
    /// A listener registered via `onEvent` panicked.
    ListenerFailure { event_name: String, reason: String },
    /// A registered object's `getState`/`applyRemoteState` panicked.
    HandlerFailure {
        object_id: String,
        phase: HandlerPhase,
        reason: String,
    },
}

impl TelemetryEvent {
    /// A stable identifier for this event kind, suitable for dashboards and
    /// alerting.
    pub fn event_name(&self) -> &'static str {
        match self {
            TelemetryEvent::InvalidRole { .. } => "SharedEvent:invalidRole",
            TelemetryEvent::RoleLookupFailure { .. } => "SharedEvent:roleLookupFailure",
            TelemetryEvent::ListenerFailure { .. } => "SharedEvent:listenerFailure",
            TelemetryEvent::HandlerFailure { .. } => "ObjectSynchronizer:handlerFailure",
        }
    }
}

/// Receives [`TelemetryEvent`]s. Implementations must not block or panic.
pub trait TelemetrySink: Send + Sync {
    fn report(&self, event: TelemetryEvent);
}

/// Logs every event via `tracing` at `warn` level. The default sink when
/// nothing more specific is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn report(&self, event: TelemetryEvent) {
        tracing::warn!(event = event.event_name(), detail = ?event, "telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<TelemetryEvent>>);

    impl TelemetrySink for CollectingSink {
        fn report(&self, event: TelemetryEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn event_names_are_stable() {
        let sink: Arc<dyn TelemetrySink> = Arc::new(CollectingSink::default());
        sink.report(TelemetryEvent::InvalidRole {
            event_name: "transport".into(),
            client_id: ClientId::from("a"),
        });
        assert_eq!(
            TelemetryEvent::InvalidRole {
                event_name: "transport".into(),
                client_id: ClientId::from("a"),
            }
            .event_name(),
            "SharedEvent:invalidRole"
        );
    }
}
