//! # fleetcast-protocol
//!
//! Wire definitions for the Fleetcast vehicle position stream.
//!
//! This crate defines what a subscriber sees on the wire: the
//! [`PositionEvent`] emitted once per vehicle per tick, the [`Frame`]
//! envelope that carries it, and two codecs for frames.
//!
//! ## Frame Types
//!
//! - `Connected` - Handshake sent when a subscriber joins
//! - `Snapshot` - Last-known position of every vehicle
//! - `Position` - A single live position update
//! - `Ping` / `Pong` - Keepalive
//! - `Error` - Server-side error report
//!
//! ## Example
//!
//! ```rust
//! use fleetcast_protocol::{codec, Frame, PositionEvent};
//!
//! let event = PositionEvent {
//!     vehicle_id: "TN-01-AN-1001".into(),
//!     lat: 13.08,
//!     lng: 80.27,
//!     route: "TNSTC Exp 144".into(),
//!     kind: "TNSTC AC".into(),
//!     origin: "Nellore".into(),
//!     destination: "Chennai".into(),
//!     timestamp: 0,
//! };
//!
//! let encoded = codec::encode(&Frame::position(event)).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod event;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use event::{now_millis, PositionEvent};
pub use frames::{Frame, FrameType};

/// Current protocol version, announced in the `Connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;
