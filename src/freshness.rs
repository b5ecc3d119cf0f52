// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The total order over `(timestamp, clientId)` used to resolve concurrent
//! writes deterministically. State is opaque to this crate; by convention
//! an application embeds its own `(timestamp, clientId)` pair in its state
//! so it can be run through [`newer`].

use std::cmp::Ordering;

use crate::signal::{ClientId, LiveEvent, Timestamp};

/// `a` is newer than `b` iff `a`'s timestamp is greater, or, on a tie, `a`'s
/// client id sorts lexicographically after `b`'s.
pub fn newer(a_ts: Timestamp, a_client: &ClientId, b_ts: Timestamp, b_client: &ClientId) -> bool {
    (a_ts, a_client) > (b_ts, b_client)
}

/// Convenience over two [`LiveEvent`]s of the same logical stream.
///
/// Events with no `client_id` sort as though their id were the empty
/// string: such an event can never have reached here from the trusted
/// inbound pipeline (which always stamps `client_id`), so this only matters
/// for locally-constructed comparisons.
pub fn newer_event(a: &LiveEvent, b: &LiveEvent) -> bool {
    let empty = ClientId::from("");
    let a_client = a.client_id.as_ref().unwrap_or(&empty);
    let b_client = b.client_id.as_ref().unwrap_or(&empty);
    newer(a.timestamp, a_client, b.timestamp, b_client)
}

/// A sortable `(timestamp, clientId)` pair implementing the Freshness Rule's
/// total order directly, for use with `sort`, `BinaryHeap`, etc.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreshnessKey(pub Timestamp, pub ClientId);

impl PartialOrd for FreshnessKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FreshnessKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0, &self.1).cmp(&(other.0, &other.1))
    }
}
