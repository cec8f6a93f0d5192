//! Flushed events and their text form
//!
//! Once the flush policy decides a frame is worth keeping, each of its
//! records leaves the call-tree buffer as a `FlushedEvent`: the original
//! record plus the nesting depth and the owning frame's name, which the
//! record alone does not carry.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::record::{Ident, Level, Record, RecordBody, Scope};

/// Class and function of the frame an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLabel {
    pub class: Ident,
    pub func: Ident,
}

impl FrameLabel {
    pub fn new(class: Ident, func: Ident) -> Self {
        Self { class, func }
    }
}

impl std::fmt::Display for FrameLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.class, self.func)
    }
}

/// A record released to the sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushedEvent {
    pub record: Record,

    /// Indentation level: a frame's depth for open/close lines, one deeper
    /// for the messages it owns
    pub depth: u16,

    /// Owning frame; `None` for category messages
    pub frame: Option<FrameLabel>,
}

impl FlushedEvent {
    pub fn new(record: Record, depth: u16, frame: Option<FrameLabel>) -> Self {
        Self {
            record,
            depth,
            frame,
        }
    }

    /// Severity used for the level column and console colour
    ///
    /// Step lines report as info.
    pub fn level(&self) -> Level {
        match &self.record.body {
            RecordBody::Message { level, .. } => *level,
            _ => Level::Info,
        }
    }

    /// Render the event as one log line, without a trailing newline
    ///
    /// `YYYY-MM-DD HH:MM:SS.mmm <l> <pid> <tag> <indent><body>`
    pub fn format_line(&self) -> String {
        let timestamp = self
            .record
            .timestamp()
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.3f");
        format!(
            "{} {} {} {} {}{}",
            timestamp,
            self.level().letter(),
            self.record.pid,
            self.record.tag,
            "  ".repeat(self.depth as usize),
            self.body_text()
        )
    }

    fn body_text(&self) -> String {
        let label = self
            .frame
            .as_ref()
            .map(|l| l.to_string())
            .unwrap_or_default();
        match &self.record.body {
            RecordBody::Open { .. } => format!("> {}", label),
            RecordBody::Close => format!("< {}", label),
            RecordBody::Message {
                scope: Scope::Category(category),
                body,
                ..
            } => format!("[{}] {}", category, body),
            RecordBody::Message { body, .. } => {
                if self.frame.is_some() {
                    format!("{}: {}", label, body)
                } else {
                    body.to_string()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OutputFlag, Tag};

    fn label() -> Option<FrameLabel> {
        Some(FrameLabel::new("Order".into(), "charge".into()))
    }

    #[test]
    fn test_open_and_close_lines() {
        let tag = Tag::new(300, 1);
        let open = FlushedEvent::new(
            Record::open(tag, 2, 1, OutputFlag::Keep, "Order", "charge"),
            1,
            label(),
        );
        let line = open.format_line();
        assert!(line.ends_with(" i 300 0000012c00000001   > Order::charge"), "{}", line);

        let close = FlushedEvent::new(Record::close(tag, 2), 1, label());
        assert!(close.format_line().ends_with("  < Order::charge"));
    }

    #[test]
    fn test_message_line_carries_level_and_indent() {
        let event = FlushedEvent::new(
            Record::message(Tag::new(1, 1), 2, Level::Error, OutputFlag::OutputAll, "card declined"),
            2,
            label(),
        );
        assert_eq!(event.level(), Level::Error);
        let line = event.format_line();
        assert!(line.contains(" e 1 "));
        assert!(line.ends_with("    Order::charge: card declined"));
    }

    #[test]
    fn test_numeric_idents_and_categories() {
        let event = FlushedEvent::new(
            Record::category(Tag::new(5, 0), Level::Warn, "net", 17u32),
            0,
            None,
        );
        assert!(event.format_line().ends_with(" [net] #17"));
    }

    #[test]
    fn test_timestamp_has_millisecond_precision() {
        let event = FlushedEvent::new(
            Record::close(Tag::new(1, 1), 1).at(1_700_000_000_123_456),
            0,
            label(),
        );
        let line = event.format_line();
        // "YYYY-MM-DD HH:MM:SS.mmm"
        assert_eq!(&line[19..20], ".");
        assert_eq!(line[20..23].parse::<u32>().unwrap(), 123);
    }
}
