//! Event and subscription types.

use crate::types::{ImageId, OperationKind, RevisionKey, Sequence, SessionId};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 256
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            filter: EventFilter::default(),
        }
    }
}

/// Which events a subscriber wants. Empty filter = everything.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub session: Option<SessionId>,
    pub image: Option<ImageId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            image: None,
        }
    }

    pub fn image(image: ImageId) -> Self {
        Self {
            session: None,
            image: Some(image),
        }
    }

    pub(crate) fn matches(&self, event: &HistoryEvent) -> bool {
        if let Some(ref wanted) = self.session {
            if event.session() != Some(wanted) {
                return false;
            }
        }
        if let Some(wanted) = self.image {
            if event.image() != Some(wanted) {
                return false;
            }
        }
        true
    }
}

/// Something that changed in the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // --- Image Events ---
    Uploaded {
        session: SessionId,
        image: ImageId,
        current: RevisionKey,
    },

    Applied {
        session: SessionId,
        image: ImageId,
        kind: OperationKind,
        sequence: Sequence,
        current: RevisionKey,
        thumbnail: RevisionKey,
    },

    Undone {
        session: SessionId,
        image: ImageId,
        sequence: Sequence,
        current: RevisionKey,
        thumbnail: RevisionKey,
    },

    Restored {
        session: SessionId,
        image: ImageId,
        sequence: Sequence,
        current: RevisionKey,
        thumbnail: RevisionKey,
    },

    Cleared {
        session: SessionId,
        image: ImageId,
        removed_entries: usize,
    },

    Deleted {
        session: SessionId,
        image: ImageId,
    },

    // --- Session Events ---
    SessionExpired {
        session: SessionId,
        images: Vec<ImageId>,
    },

    SessionRevoked {
        session: SessionId,
        images: Vec<ImageId>,
    },

    // --- Lifecycle Events ---
    /// Subscription was dropped.
    Dropped {
        reason: DropReason,
    },
}

impl HistoryEvent {
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            HistoryEvent::Uploaded { session, .. }
            | HistoryEvent::Applied { session, .. }
            | HistoryEvent::Undone { session, .. }
            | HistoryEvent::Restored { session, .. }
            | HistoryEvent::Cleared { session, .. }
            | HistoryEvent::Deleted { session, .. }
            | HistoryEvent::SessionExpired { session, .. }
            | HistoryEvent::SessionRevoked { session, .. } => Some(session),
            HistoryEvent::Dropped { .. } => None,
        }
    }

    /// The image this event concerns. Session events name no single image.
    pub fn image(&self) -> Option<ImageId> {
        match self {
            HistoryEvent::Uploaded { image, .. }
            | HistoryEvent::Applied { image, .. }
            | HistoryEvent::Undone { image, .. }
            | HistoryEvent::Restored { image, .. }
            | HistoryEvent::Cleared { image, .. }
            | HistoryEvent::Deleted { image, .. } => Some(*image),
            HistoryEvent::SessionExpired { .. }
            | HistoryEvent::SessionRevoked { .. }
            | HistoryEvent::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The engine is shutting down.
    Shutdown,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<HistoryEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<HistoryEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<HistoryEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<HistoryEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
