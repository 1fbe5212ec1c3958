//! Shim runtime configuration.
//!
//! The protocol itself fixes no timeout or concurrency policy, so both
//! bounds are explicit here rather than implicit and unbounded: a round-trip
//! call that never receives its reply fails after [`ShimConfig::call_timeout`],
//! and the pending-call table refuses registrations beyond
//! [`ShimConfig::max_pending_calls`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on simultaneously outstanding round-trip calls.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 1024;

/// Configuration for one chaincode-to-peer connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShimConfig {
    /// Peer endpoint: `grpc://host:port`, `grpcs://host:port`, or bare
    /// `host:port`.
    pub endpoint: String,
    /// Chaincode name announced during registration.
    pub chaincode_name: String,
    /// Chaincode version announced during registration.
    pub chaincode_version: String,
    /// Deadline for each round-trip call.
    pub call_timeout: Duration,
    /// Upper bound on simultaneously outstanding round-trip calls.
    pub max_pending_calls: usize,
}

impl ShimConfig {
    /// Create a configuration with default bounds.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        chaincode_name: impl Into<String>,
        chaincode_version: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            chaincode_name: chaincode_name.into(),
            chaincode_version: chaincode_version.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }

    /// Override the per-call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the in-flight call bound.
    #[must_use]
    pub fn with_max_pending_calls(mut self, max: usize) -> Self {
        self.max_pending_calls = max;
        self
    }
}
