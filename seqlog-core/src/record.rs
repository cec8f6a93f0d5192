//! Sequence log records
//!
//! A `Record` is one producer-side event: a frame opening (step in), a frame
//! closing (step out), or a message. Producers build records, the codec turns
//! them into slot bytes, and the collector decodes them back on the other side
//! of the shared channel.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle naming one logical call stack
///
/// The upper 32 bits carry the producer pid, the lower 32 bits a serial
/// allocated by the producer's client handle. The service only ever uses a
/// tag as a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u64);

impl Tag {
    pub fn new(pid: u32, serial: u32) -> Self {
        Tag(((pid as u64) << 32) | serial as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Tag(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn pid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn serial(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Message severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    /// Single-letter form used in formatted lines
    pub fn letter(self) -> char {
        match self {
            Level::Debug => 'd',
            Level::Info => 'i',
            Level::Warn => 'w',
            Level::Error => 'e',
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Level::Debug),
            1 => Some(Level::Info),
            2 => Some(Level::Warn),
            3 => Some(Level::Error),
            _ => None,
        }
    }
}

/// Output flag attached to a frame at step in, or to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OutputFlag {
    /// Stay buffered until something promotes it
    #[default]
    Keep = 0,
    /// Flush this subtree and every open ancestor up to the root
    OutputAll = 1,
    /// Flush this subtree regardless of ancestors
    Always = 2,
    /// Root frame only; resolves to `Always` or `Keep` by service configuration
    Root = 3,
}

impl OutputFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OutputFlag::Keep),
            1 => Some(OutputFlag::OutputAll),
            2 => Some(OutputFlag::Always),
            3 => Some(OutputFlag::Root),
            _ => None,
        }
    }
}

impl std::str::FromStr for OutputFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KEEP" => Ok(OutputFlag::Keep),
            "OUTPUT_ALL" => Ok(OutputFlag::OutputAll),
            "ALWAYS" => Ok(OutputFlag::Always),
            "ROOT" => Ok(OutputFlag::Root),
            other => Err(format!("unknown output flag '{}'", other)),
        }
    }
}

/// A class, function, category or message body
///
/// Producers may name things either by text or by a numeric id registered
/// out of band. Both travel through the same record variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ident {
    Text(String),
    Id(u32),
}

impl Ident {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Ident::Text(s) => Some(s),
            Ident::Id(_) => None,
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Text(s) => f.write_str(s),
            Ident::Id(id) => write!(f, "#{}", id),
        }
    }
}

impl From<&str> for Ident {
    fn from(value: &str) -> Self {
        Ident::Text(value.to_string())
    }
}

impl From<String> for Ident {
    fn from(value: String) -> Self {
        Ident::Text(value)
    }
}

impl From<u32> for Ident {
    fn from(value: u32) -> Self {
        Ident::Id(value)
    }
}

/// Where a message belongs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The deepest open frame of the record's tag
    Tag,
    /// A flat category, written immediately without buffering
    Category(Ident),
}

/// Kind-specific part of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Open {
        flag: OutputFlag,
        depth: u16,
        class: Ident,
        func: Ident,
    },
    Close,
    Message {
        level: Level,
        flag: OutputFlag,
        scope: Scope,
        body: Ident,
    },
}

/// One event produced by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Producer process id
    pub pid: u32,

    /// Call stack the record belongs to
    pub tag: Tag,

    /// Frame serial within the tag; messages carry their owning frame's
    pub seq: u32,

    /// Microseconds since the Unix epoch
    pub timestamp_us: i64,

    pub body: RecordBody,
}

impl Record {
    /// Step into a frame at `depth` (0 opens a new tag)
    pub fn open(
        tag: Tag,
        seq: u32,
        depth: u16,
        flag: OutputFlag,
        class: impl Into<Ident>,
        func: impl Into<Ident>,
    ) -> Self {
        Self::with_body(
            tag,
            seq,
            RecordBody::Open {
                flag,
                depth,
                class: class.into(),
                func: func.into(),
            },
        )
    }

    /// Step out of the frame numbered `seq`
    pub fn close(tag: Tag, seq: u32) -> Self {
        Self::with_body(tag, seq, RecordBody::Close)
    }

    /// Message attached to the frame numbered `seq`
    pub fn message(
        tag: Tag,
        seq: u32,
        level: Level,
        flag: OutputFlag,
        body: impl Into<Ident>,
    ) -> Self {
        Self::with_body(
            tag,
            seq,
            RecordBody::Message {
                level,
                flag,
                scope: Scope::Tag,
                body: body.into(),
            },
        )
    }

    /// Flat category message, never buffered
    pub fn category(
        tag: Tag,
        level: Level,
        category: impl Into<Ident>,
        body: impl Into<Ident>,
    ) -> Self {
        Self::with_body(
            tag,
            0,
            RecordBody::Message {
                level,
                flag: OutputFlag::Keep,
                scope: Scope::Category(category.into()),
                body: body.into(),
            },
        )
    }

    fn with_body(tag: Tag, seq: u32, body: RecordBody) -> Self {
        Self {
            pid: tag.pid(),
            tag,
            seq,
            timestamp_us: Utc::now().timestamp_micros(),
            body,
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp_us: i64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.timestamp_us).unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.body, RecordBody::Open { .. })
    }

    pub fn is_close(&self) -> bool {
        matches!(self.body, RecordBody::Close)
    }
}
