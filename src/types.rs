// SPDX-License-Identifier: Apache-2.0

//! Newtype wrappers and enums for validated queue inputs.
//!
//! Following the "Newtype" pattern to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ShqError, ShqResult};

/// Maximum length of a queue name (fits a POSIX shm object name).
const MAX_NAME_LEN: usize = 128;

/// Validated queue name.
///
/// Must be non-empty, at most 128 characters, printable ASCII with no `/`.
/// The leading `/` required by `shm_open` is added internally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create a new QueueName with validation.
    pub fn new(name: impl Into<String>) -> ShqResult<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(ShqError::InvalidPath {
                name,
                reason: "queue name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_NAME_LEN {
            return Err(ShqError::InvalidPath {
                reason: format!("queue name too long: {} chars (max {})", name.len(), MAX_NAME_LEN),
                name,
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '/')
        {
            return Err(ShqError::InvalidPath {
                name,
                reason: "queue name must be printable ASCII without '/'".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name as passed to `shm_open`, with the leading slash.
    pub(crate) fn shm_path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = ShqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Access capability of a queue handle.
///
/// Enforced per handle: adds require write capability, removes require
/// read capability, configuration setters require write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Queries only; no adds, removes, or setting changes.
    Immutable,
    /// Removes and queries.
    ReadOnly,
    /// Adds and queries.
    WriteOnly,
    /// Full access.
    ReadWrite,
}

impl Mode {
    /// Whether this handle may enqueue items and change settings.
    pub fn can_write(self) -> bool {
        matches!(self, Mode::WriteOnly | Mode::ReadWrite)
    }

    /// Whether this handle may dequeue items.
    pub fn can_read(self) -> bool {
        matches!(self, Mode::ReadOnly | Mode::ReadWrite)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Immutable => "immutable",
            Mode::ReadOnly => "read-only",
            Mode::WriteOnly => "write-only",
            Mode::ReadWrite => "read-write",
        };
        write!(f, "{}", s)
    }
}

/// Queue events observable through subscriptions and the monitor role.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Non-event sentinel, returned when nothing is pending.
    None = 0,
    /// First item ever added to the queue.
    Init = 1,
    /// Depth limit reached.
    Limit = 2,
    /// Time limit or target-delay threshold reached.
    Time = 3,
    /// Configured depth level reached.
    Level = 4,
    /// Last item on queue removed.
    Empty = 5,
    /// Item added to an empty queue.
    Nonempty = 6,
    /// Sentinel covering every event, for bulk subscription.
    All = 7,
}

impl Event {
    /// Bit in the subscription / pending mask. `None` contributes nothing,
    /// `All` covers every concrete event.
    pub(crate) fn mask(self) -> u32 {
        match self {
            Event::None => 0,
            Event::All => 0b0011_1111,
            e => 1 << (e as u32 - 1),
        }
    }

    /// Concrete events in the order `active_event` consumes them.
    pub(crate) const PRIORITY: [Event; 6] = [
        Event::Init,
        Event::Limit,
        Event::Time,
        Event::Level,
        Event::Empty,
        Event::Nonempty,
    ];
}

/// Type tag carried by every queue item and vector sub-item.
///
/// Tags classify payload bytes; character-set decoding of string tags is
/// left to the caller. The numeric values are part of the segment format.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    /// Vector of multiple typed sub-items.
    Vector = 0,
    /// Unspecified byte stream.
    Stream = 1,
    /// Integer, width determined by length (4 or 8 bytes).
    Integer = 2,
    /// Floating point, width determined by length (8 bytes).
    Float = 3,
    /// ASCII string (char values 0-127).
    Ascii = 4,
    /// UTF-8 string.
    Utf8 = 5,
    /// UTF-16 string.
    Utf16 = 6,
    /// JSON document.
    Json = 7,
    /// XML document.
    Xml = 8,
    /// Opaque binary struct.
    Struct = 9,
}

impl TryFrom<u32> for TypeTag {
    type Error = ShqError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TypeTag::Vector),
            1 => Ok(TypeTag::Stream),
            2 => Ok(TypeTag::Integer),
            3 => Ok(TypeTag::Float),
            4 => Ok(TypeTag::Ascii),
            5 => Ok(TypeTag::Utf8),
            6 => Ok(TypeTag::Utf16),
            7 => Ok(TypeTag::Json),
            8 => Ok(TypeTag::Xml),
            9 => Ok(TypeTag::Struct),
            _ => Err(ShqError::InvalidArgument {
                reason: format!("unknown type tag: {}", value),
            }),
        }
    }
}
