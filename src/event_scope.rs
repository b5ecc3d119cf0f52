// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! A named, role-filtered broadcast channel on top of a [`RuntimeSignaler`].

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    role::{RoleLookup, RoleSet, RoleVerifier},
    signal::{ClientId, InboundSignalMessage, LiveEvent, RuntimeSignaler, TimestampSource},
    telemetry::{TelemetryEvent, TelemetrySink},
};

/// Handle returned by [`EventScope::on_event`], used to unsubscribe via
/// [`EventScope::off_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&LiveEvent, bool) + Send + Sync>;

struct Inner<L> {
    runtime: Arc<dyn RuntimeSignaler>,
    role_verifier: Arc<RoleVerifier<L>>,
    telemetry: Arc<dyn TelemetrySink>,
    timestamps: Arc<dyn TimestampSource>,
    allowed_roles: RwLock<RoleSet>,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

/// Typed, role-filtered send/receive of named events over a
/// [`RuntimeSignaler`].
///
/// Cloning an [`EventScope`] is cheap and shares all state -- it is the same
/// scope, not a copy of it.
pub struct EventScope<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for EventScope<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: RoleLookup + 'static> EventScope<L> {
    pub fn new(
        runtime: Arc<dyn RuntimeSignaler>,
        role_verifier: Arc<RoleVerifier<L>>,
        telemetry: Arc<dyn TelemetrySink>,
        timestamps: Arc<dyn TimestampSource>,
        allowed_roles: RoleSet,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                role_verifier,
                telemetry,
                timestamps,
                allowed_roles: RwLock::new(allowed_roles),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Governs inbound filtering only; outbound sends are never filtered
    /// locally.
    pub fn allowed_roles(&self) -> RoleSet {
        self.inner.allowed_roles.read().clone()
    }

    pub fn set_allowed_roles(&self, roles: RoleSet) {
        *self.inner.allowed_roles.write() = roles;
    }

    /// Stamps `partial` with `name`, the current timestamp, and the local
    /// client id (if connected), submits it, and returns the completed
    /// envelope. Never blocks on delivery confirmation.
    pub fn send_event(&self, name: &str, partial: serde_json::Value) -> LiveEvent {
        let client_id = self.inner.runtime.client_id();
        let timestamp = self.inner.timestamps.now();
        let payload = if partial.is_object() {
            partial
        } else {
            serde_json::Value::Object(Default::default())
        };
        let event = LiveEvent {
            name: name.to_owned(),
            client_id,
            timestamp,
            payload,
        };
        let content = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.inner.runtime.submit_signal(name, content);
        event
    }

    /// Subscribe to events named `name`. The listener receives `(envelope,
    /// local)`, where `local` is true iff the event originated at this
    /// client. A panicking listener is caught and reported through
    /// [`TelemetrySink`]; it never interrupts other listeners.
    pub fn on_event<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&LiveEvent, bool) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .listeners
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off_event(&self, name: &str, id: ListenerId) {
        if let Some(v) = self.inner.listeners.lock().get_mut(name) {
            v.retain(|(i, _)| *i != id);
        }
    }

    /// Entry point the host calls from its own `on("signal", ..)` handler.
    /// Fire-and-forget: the role check is asynchronous, so this spawns the
    /// rest of the pipeline rather than blocking the caller.
    pub fn handle_inbound(&self, message: InboundSignalMessage, local: bool) {
        let this = self.clone();
        tokio::spawn(async move { this.handle_inbound_async(message, local).await });
    }

    #[tracing::instrument(skip(self, message))]
    async fn handle_inbound_async(&self, message: InboundSignalMessage, local: bool) {
        if !self.inner.runtime.connected() {
            return;
        }
        let sender = match message.client_id.clone() {
            Some(id) => id,
            None => return,
        };

        let allowed = self.allowed_roles();
        match self.inner.role_verifier.verify_roles_allowed(&sender, &allowed).await {
            Ok(true) => {},
            Ok(false) => {
                self.inner.telemetry.report(TelemetryEvent::InvalidRole {
                    event_name: message.signal_type.clone(),
                    client_id: sender,
                });
                return;
            },
            Err(err) => {
                self.inner.telemetry.report(TelemetryEvent::RoleLookupFailure {
                    client_id: sender,
                    reason: err.reason,
                });
                return;
            },
        }

        let event = self.rewrite_envelope(&message, &sender);
        self.dispatch(&event, local);
    }

    /// Parses `message.content` back into a [`LiveEvent`], always replacing
    /// `client_id` with the carrier-supplied identifier regardless of what a
    /// (potentially forged) payload claims.
    fn rewrite_envelope(&self, message: &InboundSignalMessage, sender: &ClientId) -> LiveEvent {
        let mut event: LiveEvent = serde_json::from_value(message.content.clone())
            .unwrap_or_else(|_| LiveEvent {
                name: message.signal_type.clone(),
                client_id: None,
                timestamp: self.inner.timestamps.now(),
                payload: message.content.clone(),
            });
        event.name = message.signal_type.clone();
        event.client_id = Some(sender.clone());
        event
    }

    fn dispatch(&self, event: &LiveEvent, local: bool) {
        let fns: Vec<Listener> = {
            let guard = self.inner.listeners.lock();
            guard
                .get(&event.name)
                .map(|v| v.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default()
        };
        for f in fns {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(event, local))) {
                self.inner.telemetry.report(TelemetryEvent::ListenerFailure {
                    event_name: event.name.clone(),
                    reason: panic_message(&payload),
                });
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        role::{Role, RoleLookupError},
        signal::SystemTimestampSource,
    };
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicBool, Ordering as AOrdering},
        Mutex as StdMutex,
    };

    struct FixedRoles(RoleSet);

    #[async_trait]
    impl RoleLookup for FixedRoles {
        async fn roles_for_client(&self, _: &ClientId) -> Result<RoleSet, RoleLookupError> {
            Ok(self.0.clone())
        }
    }

    struct FailingRoles;

    #[async_trait]
    impl RoleLookup for FailingRoles {
        async fn roles_for_client(&self, client_id: &ClientId) -> Result<RoleSet, RoleLookupError> {
            Err(RoleLookupError {
                client_id: client_id.clone(),
                reason: "role backend unreachable".into(),
            })
        }
    }

    #[derive(Default)]
    struct CollectingSink(StdMutex<Vec<TelemetryEvent>>);

    impl crate::telemetry::TelemetrySink for CollectingSink {
        fn report(&self, event: TelemetryEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct RecordingSignaler {
        client_id: Option<ClientId>,
        connected: AtomicBool,
        sent: StdMutex<Vec<(String, serde_json::Value)>>,
    }

    impl RuntimeSignaler for RecordingSignaler {
        fn client_id(&self) -> Option<ClientId> {
            self.client_id.clone()
        }
        fn connected(&self) -> bool {
            self.connected.load(AOrdering::SeqCst)
        }
        fn submit_signal(&self, signal_type: &str, content: serde_json::Value) {
            self.sent.lock().unwrap().push((signal_type.to_owned(), content));
        }
    }

    fn scope_with_roles(roles: RoleSet, allowed: RoleSet) -> (EventScope<FixedRoles>, Arc<RecordingSignaler>) {
        let runtime = Arc::new(RecordingSignaler {
            client_id: Some(ClientId::from("local")),
            connected: AtomicBool::new(true),
            sent: StdMutex::new(Vec::new()),
        });
        let verifier = Arc::new(RoleVerifier::new(Arc::new(FixedRoles(roles))));
        let scope = EventScope::new(
            runtime.clone(),
            verifier,
            Arc::new(crate::telemetry::TracingSink),
            Arc::new(SystemTimestampSource),
            allowed,
        );
        (scope, runtime)
    }

    #[tokio::test]
    async fn inbound_rewrites_client_id_to_carrier_identity() {
        let (scope, _runtime) = scope_with_roles(RoleSet::new(), RoleSet::new());
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        scope.on_event("transport", move |ev, local| {
            received2.lock().unwrap().push((ev.client_id.clone(), local));
        });

        let forged = serde_json::json!({
            "name": "transport",
            "clientId": "attacker-forged-id",
            "timestamp": 42,
        });
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("real-peer")),
            content: forged,
        };
        scope.handle_inbound_async(msg, false).await;

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Some(ClientId::from("real-peer")));
        assert_eq!(got[0].1, false);
    }

    #[tokio::test]
    async fn empty_allowed_roles_admits_every_client() {
        let (scope, _) = scope_with_roles(RoleSet::new(), RoleSet::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        scope.on_event("transport", move |_, _| {
            count2.fetch_add(1, AOrdering::SeqCst);
        });
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("anyone")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;
        assert_eq!(count.load(AOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disjoint_roles_are_dropped() {
        let mut roles = RoleSet::new();
        roles.insert(Role::Attendee);
        let mut allowed = RoleSet::new();
        allowed.insert(Role::Presenter);
        let (scope, _) = scope_with_roles(roles, allowed);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        scope.on_event("transport", move |_, _| {
            count2.fetch_add(1, AOrdering::SeqCst);
        });
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("attendee-1")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;
        assert_eq!(count.load(AOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disjoint_roles_report_invalid_role_not_lookup_failure() {
        let mut roles = RoleSet::new();
        roles.insert(Role::Attendee);
        let mut allowed = RoleSet::new();
        allowed.insert(Role::Presenter);

        let runtime = Arc::new(RecordingSignaler {
            client_id: Some(ClientId::from("local")),
            connected: AtomicBool::new(true),
            sent: StdMutex::new(Vec::new()),
        });
        let verifier = Arc::new(RoleVerifier::new(Arc::new(FixedRoles(roles))));
        let telemetry = Arc::new(CollectingSink::default());
        let scope = EventScope::new(
            runtime,
            verifier,
            telemetry.clone(),
            Arc::new(SystemTimestampSource),
            allowed,
        );
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("attendee-1")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;

        let events = telemetry.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TelemetryEvent::InvalidRole { .. }));
    }

    #[tokio::test]
    async fn role_lookup_failure_is_reported_distinctly_from_invalid_role() {
        let mut allowed = RoleSet::new();
        allowed.insert(Role::Presenter);

        let runtime = Arc::new(RecordingSignaler {
            client_id: Some(ClientId::from("local")),
            connected: AtomicBool::new(true),
            sent: StdMutex::new(Vec::new()),
        });
        let verifier = Arc::new(RoleVerifier::new(Arc::new(FailingRoles)));
        let telemetry = Arc::new(CollectingSink::default());
        let scope = EventScope::new(
            runtime,
            verifier,
            telemetry.clone(),
            Arc::new(SystemTimestampSource),
            allowed,
        );

        let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        scope.on_event("transport", move |_, _| {
            delivered2.fetch_add(1, AOrdering::SeqCst);
        });
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("peer-1")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;

        assert_eq!(delivered.load(AOrdering::SeqCst), 0);
        let events = telemetry.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TelemetryEvent::RoleLookupFailure { .. }
        ));
    }

    #[tokio::test]
    async fn listener_panic_is_isolated() {
        let (scope, _) = scope_with_roles(RoleSet::new(), RoleSet::new());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        scope.on_event("transport", |_, _| panic!("listener blew up"));
        scope.on_event("transport", move |_, _| {
            ran2.store(true, AOrdering::SeqCst);
        });
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("peer")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;
        assert!(ran.load(AOrdering::SeqCst));
    }

    #[tokio::test]
    async fn off_event_stops_delivery() {
        let (scope, _) = scope_with_roles(RoleSet::new(), RoleSet::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let id = scope.on_event("transport", move |_, _| {
            count2.fetch_add(1, AOrdering::SeqCst);
        });
        scope.off_event("transport", id);
        let msg = InboundSignalMessage {
            signal_type: "transport".into(),
            client_id: Some(ClientId::from("peer")),
            content: serde_json::json!({}),
        };
        scope.handle_inbound_async(msg, false).await;
        assert_eq!(count.load(AOrdering::SeqCst), 0);
    }
}
