//! Frame types for the Fleetcast protocol.
//!
//! Frames wrap everything the server sends to a subscriber. The binary codec
//! serializes them with MessagePack; browser clients get the same frames as
//! JSON text.

use serde::{Deserialize, Serialize};

use crate::event::PositionEvent;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connected = 0x01,
    Snapshot = 0x02,
    Position = 0x03,
    Ping = 0x04,
    Pong = 0x05,
    Error = 0x06,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connected),
            0x02 => Ok(FrameType::Snapshot),
            0x03 => Ok(FrameType::Position),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::Error),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscription established.
    #[serde(rename = "connected")]
    Connected {
        /// Subscriber identifier assigned by the server.
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Simulation tick interval in milliseconds.
        tick_interval_ms: u64,
    },

    /// Last-known position of every vehicle, sent once after `Connected`.
    #[serde(rename = "snapshot")]
    Snapshot {
        /// One event per vehicle.
        events: Vec<PositionEvent>,
    },

    /// Live position update.
    #[serde(rename = "position")]
    Position {
        /// The update.
        event: PositionEvent,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error report.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Snapshot { .. } => FrameType::Snapshot,
            Frame::Position { .. } => FrameType::Position,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, tick_interval_ms: u64) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            tick_interval_ms,
        }
    }

    /// Create a new Snapshot frame.
    #[must_use]
    pub fn snapshot(events: Vec<PositionEvent>) -> Self {
        Frame::Snapshot { events }
    }

    /// Create a new Position frame.
    #[must_use]
    pub fn position(event: PositionEvent) -> Self {
        Frame::Position { event }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }
}
