//! Wire Codec
//!
//! Contextual binary reader/writer for the replication protocol. Every entity
//! field write/read carries a direction+locality context so one
//! serialize/deserialize pair serves all peer relationships.

pub mod stream;

pub use stream::{ReplicationContext, SignedMessage, WireError, WireReader, WireWriter};
