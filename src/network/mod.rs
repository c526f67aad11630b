//! Network Layer
//!
//! The authoritative replication protocol engine: transport boundary, packet
//! codec, peer state machine, signed handshake, ownership-gated delta
//! replication, clock sync and the cvar/event/rcon side channels. All of it
//! is driven by one `service()` pass per tick on a dedicated thread.

pub mod cvar;
pub mod job;
pub mod manager;
pub mod packet;
pub mod peer;
pub mod security;
pub mod transport;

use thiserror::Error;

use crate::entity::EntityId;
use crate::network::packet::PacketId;
use crate::network::peer::PeerId;

pub use cvar::CvarRegistry;
pub use job::NetworkJob;
pub use manager::{Credentials, NetworkConfig, NetworkManager, ReceivedEvent};
pub use packet::{DisconnectReason, NUM_STREAMS, STREAM_ENTITY, STREAM_EVENT, STREAM_META};
pub use peer::{Peer, PeerType};
pub use security::{Identity, KeyStore, TrustStatus};
pub use transport::{
    LoopbackNetwork, LoopbackTransport, PeerHandle, PeerStats, Transport, TransportEvent,
};

/// Protocol engine errors.
///
/// Protocol violations and per-entity decode errors are caught at the
/// dispatch boundary (logged, unit of work skipped, connection survives);
/// trust failures disconnect; transport failures propagate to the caller.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport-level failure (host creation, connect, send).
    #[error("transport: {0}")]
    Transport(#[from] transport::TransportError),

    /// Packet payload failed to decode.
    #[error("wire: {0}")]
    Wire(#[from] crate::wire::WireError),

    /// Pinned-key or signature failure on the handshake.
    #[error("trust: {0}")]
    Trust(#[from] security::TrustError),

    /// Handshake envelope signature did not verify.
    #[error("handshake signature invalid")]
    SignatureInvalid,

    /// Key material problems.
    #[error("security: {0}")]
    Security(#[from] security::SecurityError),

    /// No constructor registered for a type name.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Packet referenced an entity id not in the table.
    #[error("unknown entity id: {0}")]
    UnknownEntity(EntityId),

    /// A peer tried to write an entity it does not own.
    #[error("unauthorized write to entity {entity} by peer {peer}")]
    Unauthorized {
        /// Target entity.
        entity: EntityId,
        /// Offending peer.
        peer: PeerId,
    },

    /// Packet arrived on the wrong side for its direction.
    #[error("packet {packet:?} not valid for this side")]
    WrongDirection {
        /// The misdirected packet.
        packet: PacketId,
    },

    /// Rcon password or signature check failed; the command was not executed.
    #[error("rcon command rejected")]
    RconRejected,

    /// Operation is only valid on the authoritative backend.
    #[error("not the authoritative side")]
    NotAuthoritative,

    /// Explicit instantiation asked for an id that is already live.
    #[error("entity id {0} already live")]
    DuplicateEntity(EntityId),

    /// Configuration file could not be read or parsed.
    #[error("config: {0}")]
    Config(String),
}
