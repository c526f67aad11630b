//! Packet Discriminants and Streams
//!
//! Every datagram starts with a 1-byte [`PacketId`]; the rest of the payload
//! is type-specific. Four logical transport streams keep handshake traffic,
//! entity traffic and events independently ordered.

use crate::wire::WireError;

/// Logical stream for handshake, cvars, clock and disconnects.
pub const STREAM_META: u8 = 0;
/// Logical stream for entity lifecycle and deltas.
pub const STREAM_ENTITY: u8 = 1;
/// Logical stream for custom events and rcon.
pub const STREAM_EVENT: u8 = 2;
/// Reserved fourth stream.
pub const STREAM_RESERVED: u8 = 3;
/// Stream count a host must be created with.
pub const NUM_STREAMS: u8 = 4;

/// Wire packet discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    /// S->C: begins the handshake with a signed nonce + clock.
    Welcome = 1,
    /// C->S: completes the handshake with credentials + signed nonce.
    Authenticate = 2,
    /// S->C: instantiate N entities by (id, type name).
    NewId = 3,
    /// S->C: destroy N entities by id.
    DelId = 4,
    /// S<->C: batched entity state deltas.
    DeltaId = 5,
    /// S->C: a peer joined.
    NewPeer = 6,
    /// S->C: a peer left.
    DelPeer = 7,
    /// S->C: clock resync + per-peer RTT/loss table.
    DistributedTime = 8,
    /// S<->C: replicated setting values.
    Cvar = 9,
    /// S<->C: custom application event by numeric id.
    Event = 10,
    /// C->S: signed remote console command.
    Rcon = 11,
    /// S<->C: graceful teardown with a reason.
    Disconnect = 12,
}

impl PacketId {
    /// Decode a discriminant byte. Unknown values are a typed error so the
    /// service loop can count and skip them (forward tolerance).
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => PacketId::Welcome,
            2 => PacketId::Authenticate,
            3 => PacketId::NewId,
            4 => PacketId::DelId,
            5 => PacketId::DeltaId,
            6 => PacketId::NewPeer,
            7 => PacketId::DelPeer,
            8 => PacketId::DistributedTime,
            9 => PacketId::Cvar,
            10 => PacketId::Event,
            11 => PacketId::Rcon,
            12 => PacketId::Disconnect,
            other => return Err(WireError::BadDiscriminant { value: other }),
        })
    }
}

/// Why a connection is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Orderly quit by the remote side.
    Quit = 0,
    /// Transport-level inactivity timeout.
    Timeout = 1,
    /// Host is shutting down.
    Shutdown = 2,
    /// Signature or pinned-key verification failed.
    TrustFailure = 3,
}

impl DisconnectReason {
    /// Decode a reason byte, mapping unknown values to `Quit`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DisconnectReason::Timeout,
            2 => DisconnectReason::Shutdown,
            3 => DisconnectReason::TrustFailure,
            _ => DisconnectReason::Quit,
        }
    }
}
