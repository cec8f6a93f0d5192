//! Producer-side client
//!
//! A process creates one [`SequenceLog`] at startup and hands clones of it to
//! whatever needs to trace. Each thread then keeps its own [`CallStack`],
//! which turns step in / step out / message calls into records on the shared
//! channel.
//!
//! ```rust,no_run
//! use seqlog_core::{Level, OutputFlag, SequenceLog};
//!
//! let log = SequenceLog::connect("/tmp/seqlog-1234.shm").unwrap();
//! let mut stack = log.call_stack();
//!
//! let tag = stack.step_in("Order", "process", OutputFlag::Keep).unwrap();
//! stack.message(tag, Level::Debug, "validating").unwrap();
//! stack.step_out(tag).unwrap();
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::channel::SharedChannel;
use crate::error::{Result, SeqLogError};
use crate::record::{Ident, Level, OutputFlag, Record, Tag};

struct Inner {
    channel: Arc<SharedChannel>,
    pid: u32,
    next_serial: AtomicU32,
    failed: AtomicU64,
}

/// Connection to a running sequence log service
#[derive(Clone)]
pub struct SequenceLog {
    inner: Arc<Inner>,
    root_flag: OutputFlag,
}

impl SequenceLog {
    /// Attach to the channel segment a service created at `path`
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let channel = SharedChannel::open(path.as_ref())?;
        debug!(
            path = %path.as_ref().display(),
            capacity = channel.capacity(),
            generation = channel.generation(),
            "Connected to sequence log channel"
        );
        Ok(Self::in_process(Arc::new(channel)))
    }

    /// Use a channel already mapped in this process
    pub fn in_process(channel: Arc<SharedChannel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                pid: std::process::id(),
                next_serial: AtomicU32::new(1),
                failed: AtomicU64::new(0),
            }),
            root_flag: OutputFlag::Root,
        }
    }

    /// Flag [`CallStack::enter`] uses for root frames (default `ROOT`)
    pub fn with_root_flag(mut self, flag: OutputFlag) -> Self {
        self.root_flag = flag;
        self
    }

    /// Start an empty call stack for the calling thread
    pub fn call_stack(&self) -> CallStack {
        CallStack {
            log: self.clone(),
            tag: None,
            frames: Vec::new(),
            next_seq: 0,
        }
    }

    /// Write a flat category message
    ///
    /// Category messages are not part of any call tree; the service writes
    /// them immediately.
    pub fn category_message(
        &self,
        level: Level,
        category: impl Into<Ident>,
        body: impl Into<Ident>,
    ) -> Result<()> {
        let tag = Tag::new(self.inner.pid, 0);
        self.send(&Record::category(tag, level, category, body))
    }

    /// Records this handle failed to enqueue
    pub fn failed_enqueues(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    fn next_tag(&self) -> Tag {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        Tag::new(self.inner.pid, serial)
    }

    fn send(&self, record: &Record) -> Result<()> {
        let result = self.inner.channel.enqueue(record);
        if result.is_err() {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

struct OpenFrame {
    seq: u32,
}

/// One thread's stack of open frames
///
/// The tag handed out by the root step in names the whole stack. It stays
/// valid until the root frame is stepped out of; using it afterwards, or
/// using a tag from another stack, returns `StaleTag` and sends nothing.
pub struct CallStack {
    log: SequenceLog,
    tag: Option<Tag>,
    frames: Vec<OpenFrame>,
    next_seq: u32,
}

impl CallStack {
    /// Open a frame; at depth 0 this allocates a new tag
    ///
    /// If the record cannot be enqueued the frame is not opened.
    pub fn step_in(
        &mut self,
        class: impl Into<Ident>,
        func: impl Into<Ident>,
        flag: OutputFlag,
    ) -> Result<Tag> {
        let tag = match self.tag {
            Some(tag) => tag,
            None => {
                self.next_seq = 0;
                self.log.next_tag()
            }
        };
        let seq = self.next_seq + 1;
        let depth = self.frames.len() as u16;

        self.log
            .send(&Record::open(tag, seq, depth, flag, class, func))?;

        self.next_seq = seq;
        self.tag = Some(tag);
        self.frames.push(OpenFrame { seq });
        Ok(tag)
    }

    /// Open a frame with the default flag: the handle's root flag at depth 0,
    /// `KEEP` below
    pub fn enter(&mut self, class: impl Into<Ident>, func: impl Into<Ident>) -> Result<Tag> {
        let flag = if self.frames.is_empty() {
            self.log.root_flag
        } else {
            OutputFlag::Keep
        };
        self.step_in(class, func, flag)
    }

    /// Close the innermost open frame of `tag`
    ///
    /// The frame is popped even if the close record is rejected; the service
    /// closes it implicitly when an enclosing frame closes.
    pub fn step_out(&mut self, tag: Tag) -> Result<()> {
        self.check(tag)?;
        let Some(frame) = self.frames.pop() else {
            return Err(SeqLogError::StaleTag { tag });
        };
        if self.frames.is_empty() {
            self.tag = None;
        }
        self.log.send(&Record::close(tag, frame.seq))
    }

    /// Message owned by the innermost open frame, with flag `KEEP`
    pub fn message(&mut self, tag: Tag, level: Level, body: impl Into<Ident>) -> Result<()> {
        self.message_with(tag, level, OutputFlag::Keep, body)
    }

    /// Message with an explicit output flag
    ///
    /// `OUTPUT_ALL` surfaces the whole open call path with this message.
    pub fn message_with(
        &mut self,
        tag: Tag,
        level: Level,
        flag: OutputFlag,
        body: impl Into<Ident>,
    ) -> Result<()> {
        self.check(tag)?;
        let seq = self.frames.last().map(|f| f.seq).unwrap_or(0);
        self.log
            .send(&Record::message(tag, seq, level, flag, body))
    }

    /// Current tag, if a root frame is open
    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn check(&self, tag: Tag) -> Result<()> {
        match self.tag {
            Some(current) if current == tag && !self.frames.is_empty() => Ok(()),
            _ => Err(SeqLogError::StaleTag { tag }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, OverflowPolicy};
    use crate::record::RecordBody;

    fn setup(capacity: u32) -> (Arc<SharedChannel>, SequenceLog) {
        let channel = Arc::new(
            SharedChannel::anonymous(&ChannelConfig::default().capacity(capacity)).unwrap(),
        );
        let log = SequenceLog::in_process(Arc::clone(&channel));
        (channel, log)
    }

    fn drain(channel: &SharedChannel) -> Vec<Record> {
        channel.drain().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_nested_frames_share_one_tag() {
        let (channel, log) = setup(16);
        let mut stack = log.call_stack();

        let tag = stack.step_in("Order", "process", OutputFlag::Keep).unwrap();
        let inner = stack.step_in("Order", "charge", OutputFlag::Keep).unwrap();
        assert_eq!(tag, inner);
        assert_eq!(tag.pid(), std::process::id());

        stack.message(tag, Level::Info, "charging").unwrap();
        stack.step_out(tag).unwrap();
        stack.step_out(tag).unwrap();

        let records = drain(&channel);
        let shape: Vec<(u32, &str)> = records
            .iter()
            .map(|r| {
                let kind = match &r.body {
                    RecordBody::Open { .. } => "open",
                    RecordBody::Close => "close",
                    RecordBody::Message { .. } => "message",
                };
                (r.seq, kind)
            })
            .collect();
        assert_eq!(
            shape,
            vec![(1, "open"), (2, "open"), (2, "message"), (2, "close"), (1, "close")]
        );
        match &records[1].body {
            RecordBody::Open { depth, .. } => assert_eq!(*depth, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_new_root_gets_new_tag() {
        let (_channel, log) = setup(16);
        let mut stack = log.call_stack();

        let first = stack.step_in("A", "a", OutputFlag::Keep).unwrap();
        stack.step_out(first).unwrap();
        let second = stack.step_in("A", "a", OutputFlag::Keep).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_tag_sends_nothing() {
        let (channel, log) = setup(16);
        let mut stack = log.call_stack();

        let tag = stack.step_in("A", "a", OutputFlag::Keep).unwrap();
        stack.step_out(tag).unwrap();
        drain(&channel);

        let err = stack.step_out(tag).unwrap_err();
        assert_eq!(err.error_code(), "STALE_TAG");
        assert!(stack.message(tag, Level::Error, "late").is_err());
        assert!(drain(&channel).is_empty());
    }

    #[test]
    fn test_tag_from_another_stack_is_stale() {
        let (_channel, log) = setup(16);
        let mut a = log.call_stack();
        let mut b = log.call_stack();

        let tag_a = a.step_in("A", "a", OutputFlag::Keep).unwrap();
        b.step_in("B", "b", OutputFlag::Keep).unwrap();
        assert!(b.step_out(tag_a).is_err());
        assert_eq!(b.depth(), 1);
    }

    #[test]
    fn test_enter_uses_root_flag_then_keep() {
        let (channel, log) = setup(16);
        let log = log.with_root_flag(OutputFlag::Always);
        let mut stack = log.call_stack();

        stack.enter("A", "outer").unwrap();
        stack.enter("A", "inner").unwrap();

        let flags: Vec<OutputFlag> = drain(&channel)
            .into_iter()
            .filter_map(|r| match r.body {
                RecordBody::Open { flag, .. } => Some(flag),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![OutputFlag::Always, OutputFlag::Keep]);
    }

    #[test]
    fn test_full_channel_counts_failures() {
        let (_channel, log) = setup(2);
        let mut stack = log.call_stack();

        let tag = stack.step_in("A", "a", OutputFlag::Keep).unwrap();
        stack.message(tag, Level::Info, "fills the ring").unwrap();

        let err = stack.step_in("A", "b", OutputFlag::Keep).unwrap_err();
        assert_eq!(err.error_code(), "CHANNEL_FULL");
        assert_eq!(stack.depth(), 1);
        assert_eq!(log.failed_enqueues(), 1);
    }

    #[test]
    fn test_category_message() {
        let (channel, log) = setup(4);
        log.category_message(Level::Warn, "net", "link down").unwrap();

        let records = drain(&channel);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag.serial(), 0);
    }

    #[test]
    fn test_connect_to_file_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqlog-test.shm");
        let service = SharedChannel::create(
            &path,
            &ChannelConfig::default().capacity(8).overflow(OverflowPolicy::DropNewest),
        )
        .unwrap();

        let log = SequenceLog::connect(&path).unwrap();
        let mut stack = log.call_stack();
        let tag = stack.step_in("A", 42u32, OutputFlag::Always).unwrap();
        stack.step_out(tag).unwrap();

        assert_eq!(service.drain().count(), 2);
    }
}
