//! The swarm availability bus (spec.md §6): the collaborator peer sessions
//! notify when they learn about newly available pieces, so that interest
//! can in principle be shared across peer connections (the full
//! multi-torrent/multi-peer scheduler that would consume this is a
//! spec.md §1 Non-goal; this crate only owns the broadcast point).

use tokio::sync::broadcast;

use crate::{Bitfield, PeerId};

/// Default capacity of the broadcast channel's internal ring buffer.
/// Lagging subscribers (ones that fall more than this many notifications
/// behind) miss the oldest ones; this is acceptable because the selection
/// loop only cares about the latest piece availability, not a complete
/// history.
const CHANNEL_CAPACITY: usize = 256;

/// One availability notification: the pieces a peer was just found to
/// have, and which peer reported them (so a subscriber can tell its own
/// report apart from another session's).
#[derive(Clone, Debug)]
pub struct Availability {
    pub pieces: Bitfield,
    pub source: PeerId,
}

/// A broadcast point for "a peer just became able to serve these pieces"
/// notifications (spec.md §4.D's `yield_event(Available(..))` contract,
/// §5's "swarm-level availability update is serialised through a shared
/// atomic channel").
pub struct AvailabilityBus {
    sender: broadcast::Sender<Availability>,
}

impl Default for AvailabilityBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Broadcasts that `source` has just been found to offer `pieces`. A
    /// no-op (not an error) if nobody is currently subscribed.
    pub fn available(&self, pieces: Bitfield, source: PeerId) {
        let _ = self.sender.send(Availability { pieces, source });
    }

    /// Subscribes to future availability notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Availability> {
        self.sender.subscribe()
    }
}
