// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Role lookup and the TTL-bounded, de-duplicated cache in front of it.
//!
//! The de-duplication of concurrent lookups for the same [`ClientId`]
//! follows `git::storage::fetcher::Fetchers` in the teacher: a `DashMap`
//! tracks in-flight work, and late arrivals wait on the same slot instead of
//! issuing a second lookup.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, time::Instant};

use crate::signal::ClientId;

/// A meeting-level authorization label attached to the human user behind a
/// [`ClientId`]. Extensible: add variants as new roles are introduced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Organizer,
    Presenter,
    Attendee,
    Guest,
}

pub type RoleSet = BTreeSet<Role>;

/// Returns true if `allowed` is empty, or if it intersects `roles`.
pub fn roles_allowed(roles: &RoleSet, allowed: &RoleSet) -> bool {
    allowed.is_empty() || roles.intersection(allowed).next().is_some()
}

#[derive(Debug, thiserror::Error)]
#[error("role lookup failed for {client_id}: {reason}")]
pub struct RoleLookupError {
    pub client_id: ClientId,
    pub reason: String,
}

/// Supplied by the host application: given an opaque client identifier,
/// return the set of roles that client holds.
#[async_trait]
pub trait RoleLookup: Send + Sync {
    async fn roles_for_client(&self, client_id: &ClientId) -> Result<RoleSet, RoleLookupError>;
}

struct CacheEntry {
    roles: RoleSet,
    expires_at: Instant,
}

const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Caches [`RoleLookup`] results with a TTL, and de-duplicates concurrent
/// lookups for the same client to a single underlying call.
///
/// A lookup failure does not poison the cache for longer than it takes the
/// next lookup to succeed: failures simply aren't cached, so the next caller
/// retries.
pub struct RoleVerifier<L> {
    lookup: Arc<L>,
    ttl: Duration,
    cache: DashMap<ClientId, CacheEntry>,
    in_flight: DashMap<ClientId, Arc<Notify>>,
}

impl<L: RoleLookup + 'static> RoleVerifier<L> {
    pub fn new(lookup: Arc<L>) -> Self {
        Self::with_ttl(lookup, DEFAULT_TTL)
    }

    pub fn with_ttl(lookup: Arc<L>, ttl: Duration) -> Self {
        Self {
            lookup,
            ttl,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Roles held by `client_id`, or the empty set if the lookup failed.
    /// Failures are reported by the caller through [`crate::telemetry`], not
    /// here -- this method only arbitrates the cache and in-flight
    /// de-duplication.
    pub async fn roles_for_client(&self, client_id: &ClientId) -> Result<RoleSet, RoleLookupError> {
        if let Some(entry) = self.cache.get(client_id) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.roles.clone());
            }
        }

        loop {
            // Either we become the one lookup in flight for this client, or
            // we wait on whoever already is and then re-check the cache.
            let notify = match self.in_flight.entry(client_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(o) => {
                    let notify = Arc::clone(o.get());
                    drop(o);
                    notify.notified().await;
                    if let Some(entry) = self.cache.get(client_id) {
                        if entry.expires_at > Instant::now() {
                            return Ok(entry.roles.clone());
                        }
                    }
                    continue;
                },
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    let notify = Arc::new(Notify::new());
                    v.insert(Arc::clone(&notify));
                    notify
                },
            };

            let result = self.lookup.roles_for_client(client_id).await;
            if let Ok(roles) = &result {
                self.cache.insert(
                    client_id.clone(),
                    CacheEntry {
                        roles: roles.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            self.in_flight.remove(client_id);
            notify.notify_waiters();
            return result;
        }
    }

    /// `Ok(true)` if `allowed` is empty, or the client's roles intersect it;
    /// `Ok(false)` if the lookup succeeded but the roles are disjoint from
    /// `allowed`. `Err` distinguishes a role-verifier lookup failure from a
    /// genuine role-gate rejection, so callers can log the two separately
    /// (spec.md §7: `UnauthorizedSender` vs. `RoleLookupFailure`).
    pub async fn verify_roles_allowed(
        &self,
        client_id: &ClientId,
        allowed: &RoleSet,
    ) -> Result<bool, RoleLookupError> {
        if allowed.is_empty() {
            return Ok(true);
        }
        let roles = self.roles_for_client(client_id).await?;
        Ok(roles_allowed(&roles, allowed))
    }
}
