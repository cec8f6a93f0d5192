//! Shared channel between producers and the collector
//!
//! A fixed-capacity ring of slots living in a shared memory segment. Any
//! number of producers (threads or processes) enqueue encoded records; the
//! service's single collector drains them.
//!
//! Each slot carries a stamp that encodes its state for ring position `p`:
//!
//! - `stamp == p`: free, a producer may claim position `p`
//! - `stamp == WRITING | pid`: the claimant of `p` is copying its payload
//! - `stamp == p + 1`: published, the consumer may read it
//! - after reading, the consumer sets `stamp = p + capacity`, freeing the slot
//!   for the next lap
//!
//! Producers claim positions with a CAS on `enqueue_pos`, so a full ring
//! rejects writes instead of overwriting unread slots. Before touching the
//! payload the claimant moves the stamp from `p` to `WRITING | pid`; a
//! claimant that lost its slot to stall reclaim fails that CAS and never
//! writes. A slot in the writing state is only reclaimed once its writer
//! process is gone. Nothing here takes a lock that a producer could wait on.

mod segment;

pub use segment::SharedSegment;

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, MAX_RECORD_LEN};
use crate::error::{Result, SeqLogError};
use crate::record::Record;
use crate::tree::process_alive;

/// Default number of slots
pub const DEFAULT_CAPACITY: u32 = 300;

const MAGIC: u64 = u64::from_le_bytes(*b"SEQLOGRB");
const LAYOUT_VERSION: u32 = 1;

/// Header bytes reserved ahead of the first slot
const HEADER_SPACE: usize = 128;

const POLICY_DROP_NEWEST: u32 = 0;
const POLICY_DROP_OLDEST: u32 = 1;
const POLICY_BLOCK: u32 = 2;

/// Stamp bit marking a slot whose payload is being written; the low 32 bits
/// hold the writer's pid
const WRITING: u64 = 1 << 63;

#[repr(C)]
struct RingHeader {
    magic: u64,
    layout_version: u32,
    capacity: u32,
    slot_size: u32,
    overflow: u32,
    block_timeout_ms: u32,
    _reserved: u32,
    enqueue_pos: AtomicU64,
    dequeue_pos: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    reclaimed: AtomicU64,
    generation: AtomicU64,
}

#[repr(C)]
struct Slot {
    stamp: AtomicU64,
    len: UnsafeCell<u16>,
    payload: UnsafeCell<[u8; MAX_RECORD_LEN]>,
}

const _: () = assert!(size_of::<RingHeader>() <= HEADER_SPACE);

/// What a producer does when every slot is unread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new record
    #[default]
    DropNewest,
    /// Discard the oldest unread record to make room
    DropOldest,
    /// Wait up to the timeout for the collector, then reject
    Block { timeout_ms: u32 },
}

impl OverflowPolicy {
    fn encode(self) -> (u32, u32) {
        match self {
            OverflowPolicy::DropNewest => (POLICY_DROP_NEWEST, 0),
            OverflowPolicy::DropOldest => (POLICY_DROP_OLDEST, 0),
            OverflowPolicy::Block { timeout_ms } => (POLICY_BLOCK, timeout_ms),
        }
    }

    fn decode(code: u32, timeout_ms: u32) -> Option<Self> {
        match code {
            POLICY_DROP_NEWEST => Some(OverflowPolicy::DropNewest),
            POLICY_DROP_OLDEST => Some(OverflowPolicy::DropOldest),
            POLICY_BLOCK => Some(OverflowPolicy::Block { timeout_ms }),
            _ => None,
        }
    }
}

/// Channel construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of slots, fixed for the channel's lifetime
    pub capacity: u32,
    /// Producer behavior on a full ring
    pub overflow: OverflowPolicy,
    /// How long a claimed but unpublished slot may block the consumer
    pub stall_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::DropNewest,
            stall_timeout: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Number of slots
    pub capacity: u32,
    /// Claimed but not yet consumed slots
    pub occupancy: u64,
    /// Records refused on a full ring
    pub rejected: u64,
    /// Unread records discarded under `DropOldest`
    pub dropped: u64,
    /// Slots skipped because their producer never published
    pub reclaimed: u64,
    /// Occupancy relative to capacity (0.0 - 1.0)
    pub pressure: f32,
    /// Incarnation stamp written when the segment was created
    pub generation: u64,
}

enum Push {
    Done,
    Full,
    /// Claimed, but the consumer reclaimed the slot before we wrote it
    Lost,
}

enum Pop {
    Done,
    Empty,
    /// Position is claimed by a producer that has not published yet
    Unpublished(u64),
}

struct StallWatch {
    pos: u64,
    since: Instant,
}

/// Multi-producer, single-consumer ring in shared memory
pub struct SharedChannel {
    segment: SharedSegment,
    capacity: u64,
    stall_timeout: Duration,
    stall: Mutex<Option<StallWatch>>,
}

impl SharedChannel {
    /// Conventional segment path for a service process
    pub fn segment_path(dir: &Path, service_pid: u32) -> PathBuf {
        dir.join(format!("seqlog-{}.shm", service_pid))
    }

    /// Create a file-backed channel at `path`, replacing any stale segment
    pub fn create(path: &Path, config: &ChannelConfig) -> Result<Self> {
        validate_capacity(config.capacity)?;
        if path.exists() {
            debug!(path = %path.display(), "Removing stale channel segment");
            std::fs::remove_file(path)?;
        }
        let segment = SharedSegment::create(path, segment_len(config.capacity))?;
        Ok(Self::initialize(segment, config))
    }

    /// Anonymous channel for producers inside the service process
    pub fn anonymous(config: &ChannelConfig) -> Result<Self> {
        validate_capacity(config.capacity)?;
        let segment = SharedSegment::anonymous(segment_len(config.capacity))?;
        Ok(Self::initialize(segment, config))
    }

    /// Attach to a segment created by a running service
    pub fn open(path: &Path) -> Result<Self> {
        let segment = SharedSegment::open(path).map_err(|e| SeqLogError::ChannelLayout {
            reason: format!("cannot map {}: {}", path.display(), e),
        })?;
        let capacity = validate_layout(&segment)?;
        Ok(Self {
            segment,
            capacity,
            stall_timeout: ChannelConfig::default().stall_timeout,
            stall: Mutex::new(None),
        })
    }

    fn initialize(segment: SharedSegment, config: &ChannelConfig) -> Self {
        let (overflow, block_timeout_ms) = config.overflow.encode();
        unsafe {
            ptr::write(
                segment.as_ptr().cast::<RingHeader>(),
                RingHeader {
                    magic: MAGIC,
                    layout_version: LAYOUT_VERSION,
                    capacity: config.capacity,
                    slot_size: size_of::<Slot>() as u32,
                    overflow,
                    block_timeout_ms,
                    _reserved: 0,
                    enqueue_pos: AtomicU64::new(0),
                    dequeue_pos: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                    reclaimed: AtomicU64::new(0),
                    generation: AtomicU64::new(Utc::now().timestamp_micros() as u64),
                },
            );
        }
        let channel = Self {
            segment,
            capacity: config.capacity as u64,
            stall_timeout: config.stall_timeout,
            stall: Mutex::new(None),
        };
        for pos in 0..channel.capacity {
            channel.slot(pos).stamp.store(pos, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
        channel
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.segment.as_ptr().cast::<RingHeader>() }
    }

    fn slot(&self, pos: u64) -> &Slot {
        let index = (pos % self.capacity) as usize;
        unsafe {
            &*self
                .segment
                .as_ptr()
                .add(HEADER_SPACE + index * size_of::<Slot>())
                .cast::<Slot>()
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn path(&self) -> Option<&Path> {
        self.segment.path()
    }

    /// Overflow policy recorded in the segment header
    pub fn overflow_policy(&self) -> OverflowPolicy {
        let header = self.header();
        OverflowPolicy::decode(header.overflow, header.block_timeout_ms)
            .unwrap_or(OverflowPolicy::DropNewest)
    }

    pub fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Relaxed)
    }

    /// Encode and enqueue a record
    pub fn enqueue(&self, record: &Record) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        codec::encode_into(record, &mut buf);
        self.enqueue_bytes(&buf)
    }

    /// Enqueue an already encoded record, applying the overflow policy
    pub fn enqueue_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_RECORD_LEN {
            return Err(SeqLogError::corrupt(format!(
                "{} bytes exceed the slot payload",
                bytes.len()
            )));
        }

        let outcome = match self.overflow_policy() {
            OverflowPolicy::DropNewest => self.try_push(bytes),
            OverflowPolicy::DropOldest => match self.try_push(bytes) {
                Push::Full => {
                    let mut scratch = Vec::new();
                    if let Pop::Done = self.try_pop(&mut scratch) {
                        self.header().dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    self.try_push(bytes)
                }
                other => other,
            },
            OverflowPolicy::Block { timeout_ms } => {
                self.push_blocking(bytes, Duration::from_millis(timeout_ms as u64))
            }
        };

        match outcome {
            Push::Done => Ok(()),
            Push::Full => {
                self.header().rejected.fetch_add(1, Ordering::Relaxed);
                Err(SeqLogError::ChannelFull {
                    capacity: self.capacity(),
                })
            }
            Push::Lost => Err(SeqLogError::ChannelFull {
                capacity: self.capacity(),
            }),
        }
    }

    fn push_blocking(&self, bytes: &[u8], timeout: Duration) -> Push {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            match self.try_push(bytes) {
                Push::Full if Instant::now() < deadline => {
                    if backoff.is_completed() {
                        std::thread::sleep(Duration::from_micros(100));
                    } else {
                        backoff.snooze();
                    }
                }
                other => return other,
            }
        }
    }

    fn try_push(&self, bytes: &[u8]) -> Push {
        match self.claim() {
            Some(pos) => self.write_claimed(pos, bytes),
            None => Push::Full,
        }
    }

    /// Claim the next free position, `None` when the ring is full
    fn claim(&self) -> Option<u64> {
        let header = self.header();
        let mut pos = header.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let stamp = self.slot(pos).stamp.load(Ordering::Acquire);
            if stamp & WRITING != 0 {
                // Either another producer just took `pos`, or the previous
                // lap is still being written and the ring is full
                let current = header.enqueue_pos.load(Ordering::Acquire);
                if current == pos {
                    return None;
                }
                pos = current;
                continue;
            }
            let diff = stamp as i64 - pos as i64;

            if diff == 0 {
                match header.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(pos),
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = header.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Copy `bytes` into the slot claimed at `pos` and publish it
    fn write_claimed(&self, pos: u64, bytes: &[u8]) -> Push {
        let slot = self.slot(pos);
        let writing = WRITING | std::process::id() as u64;
        if slot
            .stamp
            .compare_exchange(pos, writing, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Push::Lost;
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), slot.payload.get().cast::<u8>(), bytes.len());
            *slot.len.get() = bytes.len() as u16;
        }
        match slot
            .stamp
            .compare_exchange(writing, pos + 1, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => Push::Done,
            Err(_) => Push::Lost,
        }
    }

    fn try_pop(&self, out: &mut Vec<u8>) -> Pop {
        let header = self.header();
        let mut pos = header.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp as i64 - (pos + 1) as i64;

            if diff == 0 {
                match header.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        out.clear();
                        unsafe {
                            let len = (*slot.len.get() as usize).min(MAX_RECORD_LEN);
                            out.extend_from_slice(std::slice::from_raw_parts(
                                slot.payload.get().cast::<u8>(),
                                len,
                            ));
                        }
                        slot.stamp.store(pos + self.capacity, Ordering::Release);
                        return Pop::Done;
                    }
                    Err(current) => pos = current,
                }
            } else if stamp & WRITING != 0 || diff < 0 {
                let claimed = stamp & WRITING != 0 || stamp == pos;
                return if claimed && header.enqueue_pos.load(Ordering::Acquire) > pos {
                    Pop::Unpublished(pos)
                } else {
                    Pop::Empty
                };
            } else {
                pos = header.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Skip a slot whose producer claimed it and never published
    ///
    /// Only done once the slot has blocked the consumer for `stall_timeout`
    /// and later positions are waiting behind it. A slot still claimed but
    /// not yet being written is taken back unconditionally; one being
    /// written is taken back only when the writer process no longer exists.
    fn try_reclaim(&self, pos: u64) -> bool {
        let header = self.header();
        if header.enqueue_pos.load(Ordering::Acquire) <= pos + 1 {
            return false;
        }

        let expired = {
            let mut watch = self.stall.lock();
            match watch.as_ref() {
                Some(w) if w.pos == pos => w.since.elapsed() >= self.stall_timeout,
                _ => {
                    *watch = Some(StallWatch {
                        pos,
                        since: Instant::now(),
                    });
                    false
                }
            }
        };
        if !expired {
            return false;
        }

        let slot = self.slot(pos);
        let stamp = slot.stamp.load(Ordering::Acquire);
        let reclaimable = if stamp & WRITING != 0 {
            !process_alive((stamp & u32::MAX as u64) as u32)
        } else {
            stamp == pos
        };
        if !reclaimable
            || slot
                .stamp
                .compare_exchange(stamp, pos + self.capacity, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            // Writer alive, or published just now
            return false;
        }
        let _ = header.dequeue_pos.compare_exchange(
            pos,
            pos + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        header.reclaimed.fetch_add(1, Ordering::Relaxed);
        *self.stall.lock() = None;
        warn!(position = pos, "Reclaimed channel slot abandoned by its producer");
        true
    }

    /// Drain the records present right now
    ///
    /// The returned iterator is finite: it yields at most the occupancy
    /// observed when it was created and stops early at the first slot that
    /// is claimed but not yet published. Each item is the decoded record or
    /// the `CorruptRecord` error for that slot.
    pub fn drain(&self) -> Drain<'_> {
        let header = self.header();
        let head = header.dequeue_pos.load(Ordering::Acquire);
        let tail = header.enqueue_pos.load(Ordering::Acquire);
        Drain {
            channel: self,
            remaining: tail.saturating_sub(head),
            buf: Vec::with_capacity(MAX_RECORD_LEN),
        }
    }

    /// Current counters
    pub fn stats(&self) -> ChannelStats {
        let header = self.header();
        let head = header.dequeue_pos.load(Ordering::Relaxed);
        let tail = header.enqueue_pos.load(Ordering::Relaxed);
        let occupancy = tail.saturating_sub(head).min(self.capacity);
        ChannelStats {
            capacity: self.capacity(),
            occupancy,
            rejected: header.rejected.load(Ordering::Relaxed),
            dropped: header.dropped.load(Ordering::Relaxed),
            reclaimed: header.reclaimed.load(Ordering::Relaxed),
            pressure: occupancy as f32 / self.capacity as f32,
            generation: header.generation.load(Ordering::Relaxed),
        }
    }
}

/// Finite draining iterator, see [`SharedChannel::drain`]
pub struct Drain<'a> {
    channel: &'a SharedChannel,
    remaining: u64,
    buf: Vec<u8>,
}

impl Iterator for Drain<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            match self.channel.try_pop(&mut self.buf) {
                Pop::Done => {
                    self.remaining -= 1;
                    return Some(codec::decode(&self.buf));
                }
                Pop::Empty => return None,
                Pop::Unpublished(pos) => {
                    if self.channel.try_reclaim(pos) {
                        self.remaining -= 1;
                    } else {
                        return None;
                    }
                }
            }
        }
        None
    }
}

fn validate_capacity(capacity: u32) -> Result<()> {
    if capacity < 2 {
        return Err(SeqLogError::config(format!(
            "channel capacity must be at least 2, got {}",
            capacity
        )));
    }
    Ok(())
}

fn segment_len(capacity: u32) -> usize {
    HEADER_SPACE + capacity as usize * size_of::<Slot>()
}

fn validate_layout(segment: &SharedSegment) -> Result<u64> {
    let layout = |reason: String| SeqLogError::ChannelLayout { reason };

    if segment.len() < HEADER_SPACE {
        return Err(layout(format!("segment of {} bytes has no header", segment.len())));
    }
    let header = unsafe { &*segment.as_ptr().cast::<RingHeader>() };
    if header.magic != MAGIC {
        return Err(layout(format!("bad magic {:#018x}", header.magic)));
    }
    if header.layout_version != LAYOUT_VERSION {
        return Err(layout(format!(
            "layout version {} (expected {})",
            header.layout_version, LAYOUT_VERSION
        )));
    }
    if header.slot_size as usize != size_of::<Slot>() {
        return Err(layout(format!(
            "slot size {} (expected {})",
            header.slot_size,
            size_of::<Slot>()
        )));
    }
    if header.capacity < 2 {
        return Err(layout(format!("capacity {}", header.capacity)));
    }
    let expected = segment_len(header.capacity);
    if segment.len() != expected {
        return Err(layout(format!(
            "mapping is {} bytes, capacity {} needs {}",
            segment.len(),
            header.capacity,
            expected
        )));
    }
    if OverflowPolicy::decode(header.overflow, header.block_timeout_ms).is_none() {
        return Err(layout(format!("unknown overflow policy {}", header.overflow)));
    }
    Ok(header.capacity as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, OutputFlag, RecordBody, Tag};
    use std::sync::Arc;
    use std::thread;

    fn message(serial: u32, n: u32) -> Record {
        Record::message(
            Tag::new(1, serial),
            1,
            Level::Info,
            OutputFlag::Keep,
            format!("m{}", n),
        )
    }

    fn body_text(record: &Record) -> String {
        match &record.body {
            RecordBody::Message { body, .. } => body.to_string(),
            other => panic!("not a message: {:?}", other),
        }
    }

    fn channel(capacity: u32, overflow: OverflowPolicy) -> SharedChannel {
        SharedChannel::anonymous(&ChannelConfig::default().capacity(capacity).overflow(overflow))
            .unwrap()
    }

    #[test]
    fn test_enqueue_then_drain_in_order() {
        let ch = channel(8, OverflowPolicy::DropNewest);
        for n in 0..5 {
            ch.enqueue(&message(1, n)).unwrap();
        }
        let bodies: Vec<String> = ch.drain().map(|r| body_text(&r.unwrap())).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(ch.drain().count(), 0);
    }

    #[test]
    fn test_full_ring_rejects_without_corrupting() {
        let ch = channel(4, OverflowPolicy::DropNewest);
        for n in 0..4 {
            ch.enqueue(&message(1, n)).unwrap();
        }

        let err = ch.enqueue(&message(1, 4)).unwrap_err();
        assert_eq!(err.error_code(), "CHANNEL_FULL");
        assert_eq!(ch.stats().rejected, 1);
        assert!((ch.stats().pressure - 1.0).abs() < f32::EPSILON);

        let bodies: Vec<String> = ch.drain().map(|r| body_text(&r.unwrap())).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn test_ring_wraps_after_drain() {
        let ch = channel(3, OverflowPolicy::DropNewest);
        for round in 0..5 {
            for n in 0..3 {
                ch.enqueue(&message(1, round * 10 + n)).unwrap();
            }
            assert_eq!(ch.drain().filter(|r| r.is_ok()).count(), 3);
        }
        assert_eq!(ch.stats().occupancy, 0);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let ch = channel(3, OverflowPolicy::DropOldest);
        for n in 0..5 {
            ch.enqueue(&message(1, n)).unwrap();
        }
        let bodies: Vec<String> = ch.drain().map(|r| body_text(&r.unwrap())).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
        assert_eq!(ch.stats().dropped, 2);
    }

    #[test]
    fn test_block_policy_times_out() {
        let ch = channel(2, OverflowPolicy::Block { timeout_ms: 20 });
        ch.enqueue(&message(1, 0)).unwrap();
        ch.enqueue(&message(1, 1)).unwrap();

        let start = Instant::now();
        assert!(ch.enqueue(&message(1, 2)).is_err());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_block_policy_waits_for_consumer() {
        let ch = Arc::new(channel(2, OverflowPolicy::Block { timeout_ms: 2_000 }));
        ch.enqueue(&message(1, 0)).unwrap();
        ch.enqueue(&message(1, 1)).unwrap();

        let consumer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ch.drain().count()
            })
        };
        ch.enqueue(&message(1, 2)).unwrap();
        assert_eq!(consumer.join().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_producers_keep_per_tag_order() {
        let ch = Arc::new(channel(64, OverflowPolicy::Block { timeout_ms: 5_000 }));
        let producers: Vec<_> = (0..4)
            .map(|serial| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    for n in 0..500 {
                        ch.enqueue(&message(serial, n)).unwrap();
                    }
                })
            })
            .collect();

        let mut seen: Vec<Vec<u32>> = vec![Vec::new(); 4];
        let mut total = 0;
        while total < 2_000 {
            for record in ch.drain() {
                let record = record.unwrap();
                let n: u32 = body_text(&record)[1..].parse().unwrap();
                seen[record.tag.serial() as usize].push(n);
                total += 1;
            }
            thread::yield_now();
        }
        for p in producers {
            p.join().unwrap();
        }

        for per_tag in seen {
            assert_eq!(per_tag, (0..500).collect::<Vec<_>>());
        }
    }

    fn stalling_channel(capacity: u32) -> SharedChannel {
        SharedChannel::anonymous(
            &ChannelConfig::default()
                .capacity(capacity)
                .stall_timeout(Duration::from_millis(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_abandoned_slot_is_reclaimed() {
        let ch = stalling_channel(4);

        // A producer claims position 0 and dies before publishing
        assert_eq!(ch.claim(), Some(0));
        ch.enqueue(&message(1, 1)).unwrap();

        assert_eq!(ch.drain().count(), 0);
        thread::sleep(Duration::from_millis(5));

        let bodies: Vec<String> = ch.drain().map(|r| body_text(&r.unwrap())).collect();
        assert_eq!(bodies, vec!["m1"]);
        assert_eq!(ch.stats().reclaimed, 1);
    }

    #[test]
    fn test_late_writer_cannot_overwrite_reused_slot() {
        let ch = stalling_channel(2);
        let stalled = ch.claim().unwrap();
        ch.enqueue(&message(1, 1)).unwrap();

        assert_eq!(ch.drain().count(), 0);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(ch.drain().count(), 1);
        assert_eq!(ch.stats().reclaimed, 1);

        // Slot 0 is handed to the next lap
        ch.enqueue(&message(2, 2)).unwrap();

        // The stalled producer resumes
        let mut late = Vec::new();
        codec::encode_into(&message(9, 9), &mut late);
        assert!(matches!(ch.write_claimed(stalled, &late), Push::Lost));

        let drained: Vec<Record> = ch.drain().map(|r| r.unwrap()).collect();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tag, Tag::new(1, 2));
        assert_eq!(body_text(&drained[0]), "m2");
    }

    #[test]
    fn test_slot_being_written_by_live_process_is_not_reclaimed() {
        let ch = stalling_channel(4);
        let pos = ch.claim().unwrap();
        ch.slot(pos)
            .stamp
            .store(WRITING | std::process::id() as u64, Ordering::Release);
        ch.enqueue(&message(1, 1)).unwrap();

        assert_eq!(ch.drain().count(), 0);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(ch.drain().count(), 0);
        assert_eq!(ch.stats().reclaimed, 0);
    }

    #[test]
    fn test_slot_being_written_by_dead_process_is_reclaimed() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let ch = stalling_channel(4);
        let pos = ch.claim().unwrap();
        ch.slot(pos)
            .stamp
            .store(WRITING | dead_pid as u64, Ordering::Release);
        ch.enqueue(&message(1, 1)).unwrap();

        assert_eq!(ch.drain().count(), 0);
        thread::sleep(Duration::from_millis(5));
        let bodies: Vec<String> = ch.drain().map(|r| body_text(&r.unwrap())).collect();
        assert_eq!(bodies, vec!["m1"]);
        assert_eq!(ch.stats().reclaimed, 1);
    }

    #[test]
    fn test_corrupt_slot_reported_and_skipped() {
        let ch = channel(4, OverflowPolicy::DropNewest);
        ch.enqueue_bytes(&[3, 0, 1]).unwrap();
        ch.enqueue(&message(1, 0)).unwrap();

        let items: Vec<_> = ch.drain().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_file_channel_shared_with_producer_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = SharedChannel::segment_path(dir.path(), 77);
        let service = SharedChannel::create(
            &path,
            &ChannelConfig::default().capacity(16).overflow(OverflowPolicy::DropOldest),
        )
        .unwrap();

        let producer = SharedChannel::open(&path).unwrap();
        assert_eq!(producer.capacity(), 16);
        assert_eq!(producer.overflow_policy(), OverflowPolicy::DropOldest);
        assert_eq!(producer.generation(), service.generation());

        producer.enqueue(&message(3, 9)).unwrap();
        let drained: Vec<Record> = service.drain().map(|r| r.unwrap()).collect();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tag, Tag::new(1, 3));
    }

    #[test]
    fn test_open_rejects_foreign_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.shm");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let err = SharedChannel::open(&path).err().unwrap();
        assert_eq!(err.error_code(), "CHANNEL_LAYOUT");
    }

    #[test]
    fn test_capacity_below_two_rejected() {
        let err = SharedChannel::anonymous(&ChannelConfig::default().capacity(1))
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
