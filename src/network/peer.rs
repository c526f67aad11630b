//! Peer Session Records
//!
//! Per-connection state: identity, authority progression, link quality and
//! the outgoing queues that make lifecycle fan-out per-peer rather than
//! broadcast (a peer joining mid-session gets a full backlog; everyone else
//! only the delta).

use crate::entity::EntityId;
use crate::network::transport::PeerHandle;

/// Backend-assigned peer identifier. Monotonically increasing; −2 is
/// reserved for local bot peers (see [`crate::entity::player::PEER_BOT`]).
pub type PeerId = i32;

/// Connection authority progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    /// Terminal state; no live transport link.
    Unconnected,
    /// Transport-connected but not yet authenticated.
    Undifferentiated,
    /// Authenticated player with a bound player entity.
    ConnectedPlayer,
    /// Reserved for non-player service connections.
    Machine,
}

/// One connection's session state.
pub struct Peer {
    /// Transport-level handle.
    pub handle: PeerHandle,
    /// Backend-assigned id; meaningless until authenticated.
    pub peer_id: PeerId,
    /// Authority state.
    pub peer_type: PeerType,
    /// Username presented at authentication.
    pub display_name: String,
    /// Bound player entity, re-resolved each tick by scanning player
    /// entities for `remote_peer_id == peer_id`.
    pub player_entity: Option<EntityId>,
    /// Smoothed round-trip time (ms).
    pub rtt_ms: u32,
    /// Packet loss estimate, 0.0..=1.0.
    pub packet_loss: f32,
    /// True until the peer has received its full initial snapshot.
    pub noob: bool,
    /// Entities this peer must be told to instantiate.
    pub pending_new_ids: Vec<EntityId>,
    /// Entities this peer must be told to destroy.
    pub pending_del_ids: Vec<EntityId>,
    /// Custom events queued for this peer: (event id, payload).
    pub queued_events: Vec<(u16, Vec<u8>)>,
    /// Cvar values queued for this peer.
    pub pending_cvars: Vec<(String, String)>,
}

impl Peer {
    /// Create a freshly-connected, unauthenticated peer.
    pub fn undifferentiated(handle: PeerHandle) -> Self {
        Self {
            handle,
            peer_id: -1,
            peer_type: PeerType::Undifferentiated,
            display_name: String::new(),
            player_entity: None,
            rtt_ms: 0,
            packet_loss: 0.0,
            noob: true,
            pending_new_ids: Vec::new(),
            pending_del_ids: Vec::new(),
            queued_events: Vec::new(),
            pending_cvars: Vec::new(),
        }
    }

    /// True once authenticated as a player.
    pub fn is_player(&self) -> bool {
        self.peer_type == PeerType::ConnectedPlayer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_is_undifferentiated_noob() {
        let peer = Peer::undifferentiated(11);
        assert_eq!(peer.peer_type, PeerType::Undifferentiated);
        assert!(peer.noob);
        assert!(!peer.is_player());
        assert!(peer.pending_new_ids.is_empty());
    }
}
