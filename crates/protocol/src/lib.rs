//! Wire messages for the bus protocol
//!
//! Serde message types for the four remote services (control, command, query,
//! event), the CBOR frame helpers that put them on the wire, and the route
//! table. Payload envelopes inside these messages come from `busline-codec`;
//! their data blobs are opaque here.

pub mod command;
pub mod common;
pub mod control;
pub mod event;
pub mod frame;
pub mod query;
pub mod routes;

pub use frame::FrameError;
