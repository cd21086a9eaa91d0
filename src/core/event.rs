//! Events carried by the bus.
//!
//! Membership events carry upstream / backend payloads; server and request
//! lifecycle events carry only a kind and a timestamp.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::upstream::{Backend, BackendId, Upstream, UpstreamId};

/// The kind of an event, used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UpstreamAdded,
    UpstreamRemoved,
    BackendAdded,
    BackendRemoved,
    ServerStarted,
    ServerStopped,
    RequestAccepted,
    RequestSuccess,
    RequestError,
}

/// The four membership kinds, in one slice for subscription convenience.
pub const MEMBERSHIP_KINDS: [EventKind; 4] = [
    EventKind::UpstreamAdded,
    EventKind::UpstreamRemoved,
    EventKind::BackendAdded,
    EventKind::BackendRemoved,
];

/// Every event kind the bus carries.
pub const ALL_KINDS: [EventKind; 9] = [
    EventKind::UpstreamAdded,
    EventKind::UpstreamRemoved,
    EventKind::BackendAdded,
    EventKind::BackendRemoved,
    EventKind::ServerStarted,
    EventKind::ServerStopped,
    EventKind::RequestAccepted,
    EventKind::RequestSuccess,
    EventKind::RequestError,
];

/// A single event published on the bus. Payload-carrying variants hold their
/// payloads behind an `Arc` so fan-out to many listeners stays cheap.
#[derive(Debug, Clone)]
pub enum Event {
    UpstreamAdded(Arc<Upstream>),
    UpstreamRemoved(UpstreamId),
    BackendAdded {
        upstream_id: UpstreamId,
        backend: Arc<Backend>,
    },
    BackendRemoved(BackendId),
    /// Server or request lifecycle marker. `kind` is never one of the four
    /// membership kinds.
    Lifecycle {
        kind: EventKind,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Build a lifecycle event stamped now.
    pub fn lifecycle(kind: EventKind) -> Self {
        debug_assert!(
            !MEMBERSHIP_KINDS.contains(&kind),
            "membership events carry payloads"
        );
        Event::Lifecycle {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::UpstreamAdded(_) => EventKind::UpstreamAdded,
            Event::UpstreamRemoved(_) => EventKind::UpstreamRemoved,
            Event::BackendAdded { .. } => EventKind::BackendAdded,
            Event::BackendRemoved(_) => EventKind::BackendRemoved,
            Event::Lifecycle { kind, .. } => *kind,
        }
    }
}
