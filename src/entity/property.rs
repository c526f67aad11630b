//! Replicated Property Wrapper
//!
//! A scalar/string field that tracks whether a locally-set value has been
//! flushed over the wire yet. Local mutation (`set`) marks the field dirty;
//! applying a remote value (`set_remote`, only ever called from an entity's
//! deserialize path) clears it.

use crate::wire::{WireError, WireReader, WireWriter};

/// Where a property change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Game code on this side called `set`.
    Local,
    /// A received packet applied the value via `set_remote`.
    Remote,
}

/// Observer invoked on every value change, before the value is stored.
///
/// Receives the outgoing value, the incoming value, and the origin; this is
/// the single seam behind the changing-locally / changing-remotely /
/// changing signal triple.
pub type ChangeWatcher<T> = fn(old: &T, new: &T, origin: ChangeOrigin);

/// Scalar wire encoding for property value types.
pub trait WireValue: Sized {
    /// Append this value to a packet.
    fn write_value(&self, w: &mut WireWriter);
    /// Decode a value from a packet.
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

impl WireValue for bool {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_bool(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_bool()
    }
}

impl WireValue for u8 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_u8(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_u8()
    }
}

impl WireValue for u16 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_u16(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_u16()
    }
}

impl WireValue for u32 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_u32(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_u32()
    }
}

impl WireValue for u64 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_u64(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_u64()
    }
}

impl WireValue for i32 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_i32(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_i32()
    }
}

impl WireValue for i64 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_i64(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_i64()
    }
}

impl WireValue for f32 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_f32(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_f32()
    }
}

impl WireValue for f64 {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_f64(*self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_f64()
    }
}

impl WireValue for String {
    fn write_value(&self, w: &mut WireWriter) {
        w.write_string(self);
    }
    fn read_value(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.read_string()
    }
}

/// A replicated field.
///
/// Invariant: `dirty` is true iff a locally-set value has not been written by
/// a serialize pass since.
#[derive(Debug, Clone)]
pub struct ReplicateProperty<T> {
    value: T,
    dirty: bool,
    watcher: Option<ChangeWatcher<T>>,
}

impl<T: WireValue> ReplicateProperty<T> {
    /// Wrap an initial value. Starts clean.
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
            watcher: None,
        }
    }

    /// Wrap an initial value with a change observer.
    pub fn with_watcher(value: T, watcher: ChangeWatcher<T>) -> Self {
        Self {
            value,
            dirty: false,
            watcher: Some(watcher),
        }
    }

    /// Current value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Local mutation path. Marks the field dirty; does not transmit.
    pub fn set(&mut self, value: T) {
        if let Some(watch) = self.watcher {
            watch(&self.value, &value, ChangeOrigin::Local);
        }
        self.value = value;
        self.dirty = true;
    }

    /// Remote application path, invoked only from deserialize. Clears dirty.
    pub fn set_remote(&mut self, value: T) {
        if let Some(watch) = self.watcher {
            watch(&self.value, &value, ChangeOrigin::Remote);
        }
        self.value = value;
        self.dirty = false;
    }

    /// True if a local change has not been flushed yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Serialize path: write the current value and clear dirty.
    pub fn write(&mut self, w: &mut WireWriter) {
        self.value.write_value(w);
        self.dirty = false;
    }

    /// Deserialize path: read a value and apply it as remote.
    pub fn read(&mut self, r: &mut WireReader<'_>) -> Result<(), WireError> {
        let value = T::read_value(r)?;
        self.set_remote(value);
        Ok(())
    }
}
