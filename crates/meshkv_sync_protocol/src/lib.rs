//! # MeshKV Sync Protocol
//!
//! Protocol types and CBOR packet codec for MeshKV device-to-device sync.
//!
//! This crate provides:
//! - [`DataItem`], one row's synchronizable representation
//! - [`SyncTimeRange`] and watermark types
//! - Data request/ack, ability-sync and control packets
//! - The [`Message`] envelope carried by the communicator
//! - Last-writer-wins [`conflict`] resolution
//!
//! This is a pure protocol crate with no I/O operations. Malformed input is
//! rejected with a [`CodecError`]; unknown trailing fields from newer peers
//! are ignored, never fatal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod conflict;
mod error;
mod item;
mod packets;
mod range;
mod wire;

pub use error::{CodecError, CodecResult};
pub use item::{flags, hash_key_for, DataItem, DeviceId, Timestamp};
pub use packets::{
    AbilityAck, AbilityRequest, ControlAckPacket, ControlCmd, ControlRequestPacket, DataAckPacket,
    DataRequestPacket, Message, RecvCode, SyncMode, SyncPacket, PROTOCOL_VERSION_BASE,
    PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_WINDOWED, SEND_FINISHED,
};
pub use range::{SyncTimeRange, WaterMark, WaterMarkUpdate};
