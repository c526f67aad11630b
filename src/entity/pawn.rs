//! Pawn Entity
//!
//! A movable prop: reliable identity fields plus a high-frequency transform
//! replicated over the unreliable path. The owning peer drives the transform;
//! everyone else receives the backend's smoothed snapshots.

use std::any::Any;

use crate::entity::property::ReplicateProperty;
use crate::entity::{Entity, EntityId};
use crate::network::peer::PeerId;
use crate::entity::player::PEER_UNCONTROLLED;
use crate::wire::{ReplicationContext, WireError, WireReader, WireWriter};

/// A movable, optionally peer-driven prop.
pub struct Pawn {
    id: EntityId,
    /// Human-readable label. Reliable; the owner may rename its own pawn.
    pub label: ReplicateProperty<String>,
    /// Driving peer id, or [`PEER_UNCONTROLLED`]. Server-authoritative.
    pub owner_peer: ReplicateProperty<PeerId>,
    /// Transform, replicated unreliably every tick while dirty.
    pub x: ReplicateProperty<f32>,
    /// See `x`.
    pub y: ReplicateProperty<f32>,
    /// Velocity, replicated with the transform.
    pub vx: ReplicateProperty<f32>,
    /// See `vx`.
    pub vy: ReplicateProperty<f32>,
}

impl Pawn {
    /// Registered type name.
    pub const TYPE_NAME: &'static str = "pawn";

    /// Create an unowned pawn at the origin.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            label: ReplicateProperty::new(String::new()),
            owner_peer: ReplicateProperty::new(PEER_UNCONTROLLED),
            x: ReplicateProperty::new(0.0),
            y: ReplicateProperty::new(0.0),
            vx: ReplicateProperty::new(0.0),
            vy: ReplicateProperty::new(0.0),
        }
    }

    /// Registry constructor.
    pub fn construct(id: EntityId) -> Box<dyn Entity> {
        Box::new(Self::new(id))
    }

    /// True if any transform field has an unflushed local change.
    pub fn transform_dirty(&self) -> bool {
        self.x.is_dirty() || self.y.is_dirty() || self.vx.is_dirty() || self.vy.is_dirty()
    }
}

impl Entity for Pawn {
    fn id(&self) -> EntityId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn serialize(&mut self, w: &mut WireWriter, ctx: ReplicationContext) {
        if ctx.client_bound() {
            self.label.write(w);
            self.owner_peer.write(w);
            if ctx.is_initial() {
                // Full snapshot: a joining peer needs the transform even if
                // no unreliable delta is in flight.
                self.x.write(w);
                self.y.write(w);
                self.vx.write(w);
                self.vy.write(w);
            }
        } else if ctx.is_local() {
            // The owner may rename its own pawn; nothing else flows up
            // reliably.
            self.label.write(w);
        }
    }

    fn deserialize(
        &mut self,
        r: &mut WireReader<'_>,
        ctx: ReplicationContext,
    ) -> Result<(), WireError> {
        if ctx.client_bound() {
            self.label.read(r)?;
            self.owner_peer.read(r)?;
            if ctx.is_initial() {
                self.x.read(r)?;
                self.y.read(r)?;
                self.vx.read(r)?;
                self.vy.read(r)?;
            }
        } else if ctx.is_local() {
            self.label.read(r)?;
        }
        Ok(())
    }

    fn serialize_unreliable(&mut self, w: &mut WireWriter, _ctx: ReplicationContext) {
        self.x.write(w);
        self.y.write(w);
        self.vx.write(w);
        self.vy.write(w);
    }

    fn deserialize_unreliable(
        &mut self,
        r: &mut WireReader<'_>,
        _ctx: ReplicationContext,
    ) -> Result<(), WireError> {
        self.x.read(r)?;
        self.y.read(r)?;
        self.vx.read(r)?;
        self.vy.read(r)?;
        Ok(())
    }

    fn owned_by(&self, peer_id: PeerId) -> bool {
        peer_id >= 0 && *self.owner_peer.get() == peer_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_snapshot_roundtrips_every_field() {
        let mut source = Pawn::new(7);
        source.label.set("crate".into());
        source.owner_peer.set(2);
        source.x.set(10.5);
        source.y.set(-3.0);
        source.vx.set(1.0);
        source.vy.set(0.25);

        let mut w = WireWriter::new();
        source.serialize(&mut w, ReplicationContext::ToNewClient);
        let bytes = w.into_bytes();

        let mut dest = Pawn::new(7);
        let mut r = WireReader::new(&bytes);
        dest.deserialize(&mut r, ReplicationContext::ToNewClient).unwrap();

        assert_eq!(dest.label.get(), "crate");
        assert_eq!(*dest.owner_peer.get(), 2);
        assert_eq!(*dest.x.get(), 10.5);
        assert_eq!(*dest.y.get(), -3.0);
        assert_eq!(*dest.vx.get(), 1.0);
        assert_eq!(*dest.vy.get(), 0.25);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn unreliable_delta_is_idempotent() {
        let mut source = Pawn::new(1);
        source.x.set(4.0);
        source.y.set(8.0);

        let mut w = WireWriter::new();
        source.serialize_unreliable(&mut w, ReplicationContext::ToClient);
        let bytes = w.into_bytes();

        let mut dest = Pawn::new(1);
        let mut r = WireReader::new(&bytes);
        dest.deserialize_unreliable(&mut r, ReplicationContext::FromServer)
            .unwrap();
        let once = (*dest.x.get(), *dest.y.get());

        let mut r = WireReader::new(&bytes);
        dest.deserialize_unreliable(&mut r, ReplicationContext::FromServer)
            .unwrap();
        assert_eq!(once, (*dest.x.get(), *dest.y.get()));
    }

    #[test]
    fn owner_rename_travels_server_bound() {
        let mut source = Pawn::new(2);
        source.label.set("mine".into());

        let mut w = WireWriter::new();
        source.serialize(&mut w, ReplicationContext::ToServerLocal);
        let bytes = w.into_bytes();
        assert!(!bytes.is_empty());

        let mut dest = Pawn::new(2);
        let mut r = WireReader::new(&bytes);
        dest.deserialize(&mut r, ReplicationContext::FromClientLocal)
            .unwrap();
        assert_eq!(dest.label.get(), "mine");

        // Without authority the server-bound pass is empty.
        let mut w = WireWriter::new();
        source.serialize(&mut w, ReplicationContext::ToServer);
        assert!(w.is_empty());
    }
}
