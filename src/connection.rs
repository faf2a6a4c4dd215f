//! Connection identity and lifecycle state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque connection identity, unique for the lifetime of the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Issues unique [`ConnId`]s for the lifetime of one reactor instance.
#[derive(Default)]
pub struct ConnIdGenerator {
    next: AtomicU64,
}

impl ConnIdGenerator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Role a connection is currently filling, tracked by the reactor for the
/// disconnect path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, handshake not yet completed.
    Accepted,
    /// Registered as the publisher for the named mount point.
    Publisher(String),
    /// Attached as a subscriber of the named mount point.
    Subscriber(String),
}
