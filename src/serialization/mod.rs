//! Batch encoding and the serializer actor
//!
//! [`Serializer`] buffers records handed to it by appenders and writes each
//! batch to the file queue through [`codec::serialize`]. The endpoint reads the
//! batch back with [`codec::deserialize`].

pub mod codec;
mod serializer;

pub use serializer::{EntryStore, Serializer};
