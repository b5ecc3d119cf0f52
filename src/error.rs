// Copyright © 2019-2020 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use thiserror::Error;

/// Errors that escape to the caller.
///
/// Per the propagation policy, only programmer errors are surfaced here.
/// Runtime protocol failures (role rejections, handler panics, role-lookup
/// failures) are isolated and reported through [`crate::telemetry`] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("object `{0}` is already registered in this container")]
    DuplicateRegistration(String),
}
