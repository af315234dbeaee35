// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Error types returned by the offload core.

use std::fmt;

/// The four-value errno-shaped result the exposed core surface returns.
///
/// Mirrors the C ABI a NIC vendor driver binding targets: callers outside this crate generally
/// want one of these four values, not the richer [`OffloadError`] that produced them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Errno {
    /// The match/action pair cannot be represented in hardware.
    EopNotSupp,
    /// An identifier pool or other finite resource is exhausted.
    ENoMem,
    /// A driver call failed, or the targeted device does not exist.
    ENoDev,
    /// A port or flow-id argument did not resolve to a known object.
    EInval,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::EopNotSupp => "EOPNOTSUPP",
            Errno::ENoMem => "ENOMEM",
            Errno::ENoDev => "ENODEV",
            Errno::EInval => "EINVAL",
        };
        f.write_str(s)
    }
}

/// Errors raised while validating, translating, installing or tearing down an offloaded flow.
///
/// Bugs rather than recoverable failures (double free, refcount underflow, an offload record
/// overflowing its capacity) never reach this type at all; they go through
/// [`invariant_violated`] and panic instead, per the fatal policy in the error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// The match or action list uses a field or combination hardware cannot represent.
    #[error("unsupported flow: {0}")]
    Unsupported(&'static str),

    /// An identifier pool ran out of ids, or an allocation otherwise failed.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The NIC driver rejected a rule create or destroy call.
    #[error("driver failure on {operation}: {source}")]
    DriverFailure {
        /// What the driver was asked to do (`"create"` or `"destroy"`).
        operation: &'static str,
        /// The driver-reported cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A port or flow-id did not resolve to a known object.
    #[error("not found: {0}")]
    NotFound(&'static str),
}

impl OffloadError {
    /// Convert to the four-value errno the exposed API returns.
    ///
    /// `DriverFailure` always maps to `ENODEV`, since from the caller's perspective a rejected
    /// rule and a vanished device are indistinguishable: the hardware did not take the rule.
    #[must_use]
    pub fn to_errno(&self) -> Errno {
        match self {
            OffloadError::Unsupported(_) => Errno::EopNotSupp,
            OffloadError::Exhausted(_) => Errno::ENoMem,
            OffloadError::DriverFailure { .. } => Errno::ENoDev,
            OffloadError::NotFound(_) => Errno::EInval,
        }
    }
}

/// Panics with a message identifying the broken invariant.
///
/// Used instead of `Result` for conditions that are fatal by design: double-free, refcount
/// underflow, an offload record overflowing its capacity. These represent bugs in this crate or
/// its callers, not recoverable runtime failures, so unwinding into an `OffloadError` would
/// misrepresent them as something a caller could retry around.
#[track_caller]
pub fn invariant_violated(msg: &str) -> ! {
    panic!("hw-offload: invariant violated: {msg}");
}
