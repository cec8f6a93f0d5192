//! Call-tree buffer
//!
//! Holds, per tag, the chain of frames that are currently open together with
//! the messages they buffer while undecided. Frames live in one arena indexed
//! by `NodeId`; a tag's tree is its open stack plus parent links.
//!
//! Closed frames never stay in the arena. A frame that closes flushed has
//! already streamed everything it owns, and one that closes pending can no
//! longer be promoted, so both are resolved and freed at step out.
//!
//! All mutation happens on the collector thread, so nothing here locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SeqLogError};
use crate::event::{FlushedEvent, FrameLabel};
use crate::policy::{Decision, FlushPolicy, Promotion};
use crate::record::{Record, RecordBody, Scope, Tag};

type NodeId = usize;

/// Default ceiling on buffered frames and messages
pub const DEFAULT_MAX_BUFFERED_NODES: usize = 100_000;

struct FrameNode {
    seq: u32,
    depth: u16,
    label: FrameLabel,
    open: Record,
    decision: Decision,
    forces_subtree: bool,
    open_emitted: bool,
    parent: Option<NodeId>,
    buffered: Vec<Record>,
}

struct TagTree {
    root_seq: u32,
    open: Vec<NodeId>,
    pid: u32,
    order: u64,
    last_activity: Instant,
    /// Nothing from this tag has reached a sink yet
    fully_pending: bool,
}

enum RecordKind {
    Open,
    Close,
    Category,
    Message,
}

struct Tombstone {
    root_seq: u32,
    last_activity: Instant,
}

/// Counters kept by the buffer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStats {
    /// Tags with at least one open frame
    pub open_tags: usize,
    /// Frames plus buffered messages currently held
    pub buffered_nodes: usize,
    /// Events handed to the sinks
    pub events_flushed: u64,
    /// Frames and messages dropped by a discard decision, eviction or reaping
    pub nodes_discarded: u64,
    /// Trees evicted to stay under the node ceiling
    pub trees_evicted: u64,
    /// Tags reaped after their producer died
    pub tags_reaped: u64,
    /// Records ignored because their tag had been evicted
    pub evicted_records_ignored: u64,
}

/// Per-tag buffered call trees, see the module docs
pub struct CallTreeBuffer {
    nodes: Vec<Option<FrameNode>>,
    free: Vec<NodeId>,
    trees: HashMap<Tag, TagTree>,
    tombstones: HashMap<Tag, Tombstone>,
    policy: FlushPolicy,
    max_nodes: usize,
    buffered_nodes: usize,
    next_order: u64,
    capacity_warned: bool,
    stats: TreeStats,
}

impl CallTreeBuffer {
    pub fn new(policy: FlushPolicy, max_nodes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            trees: HashMap::new(),
            tombstones: HashMap::new(),
            policy,
            max_nodes,
            buffered_nodes: 0,
            next_order: 0,
            capacity_warned: false,
            stats: TreeStats::default(),
        }
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            open_tags: self.trees.len(),
            buffered_nodes: self.buffered_nodes,
            ..self.stats.clone()
        }
    }

    pub fn open_tags(&self) -> usize {
        self.trees.len()
    }

    pub fn buffered_nodes(&self) -> usize {
        self.buffered_nodes
    }

    /// Apply one decoded record, appending whatever became final to `out`
    ///
    /// A `ProtocolViolation` leaves the buffer exactly as it was.
    pub fn apply(&mut self, record: Record, now: Instant, out: &mut Vec<FlushedEvent>) -> Result<()> {
        let before = out.len();
        let kind = match &record.body {
            RecordBody::Open { .. } => RecordKind::Open,
            RecordBody::Close => RecordKind::Close,
            RecordBody::Message {
                scope: Scope::Category(_),
                ..
            } => RecordKind::Category,
            RecordBody::Message { .. } => RecordKind::Message,
        };
        let result = match kind {
            RecordKind::Open => self.on_open(record, now, out),
            RecordKind::Close => self.on_close(record, now, out),
            RecordKind::Category => {
                out.push(FlushedEvent::new(record, 0, None));
                Ok(())
            }
            RecordKind::Message => self.on_message(record, now, out),
        };
        self.stats.events_flushed += (out.len() - before) as u64;
        self.enforce_capacity();
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record handlers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_open(&mut self, record: Record, now: Instant, out: &mut Vec<FlushedEvent>) -> Result<()> {
        let (flag, depth, label) = match &record.body {
            RecordBody::Open {
                flag,
                depth,
                class,
                func,
            } => (*flag, *depth, FrameLabel::new(class.clone(), func.clone())),
            _ => return Ok(()),
        };
        let tag = record.tag;

        if let Some(stone) = self.tombstones.get_mut(&tag) {
            if depth != 0 {
                stone.last_activity = now;
                self.stats.evicted_records_ignored += 1;
                return Ok(());
            }
            self.tombstones.remove(&tag);
        }

        let open_depth = self.trees.get(&tag).map(|t| t.open.len()).unwrap_or(0);
        if depth as usize > open_depth {
            return Err(SeqLogError::ProtocolViolation {
                tag,
                reason: format!(
                    "step in at depth {} but only {} frames are open",
                    depth, open_depth
                ),
            });
        }
        if (depth as usize) < open_depth {
            // Step outs were lost on the way; close down to the new frame's parent
            debug!(%tag, depth, open_depth, "Implicitly closing frames before step in");
            self.close_down_to(tag, depth as usize, record.timestamp_us, out);
        }

        let parent = self.trees.get(&tag).and_then(|t| t.open.last().copied());
        let is_root = parent.is_none();
        let parent_forces = parent
            .and_then(|id| self.node(id))
            .map(|n| n.forces_subtree)
            .unwrap_or(false);

        let resolution = self.policy.resolve_open(flag, is_root, parent_forces);
        if resolution.misplaced_root {
            warn!(%tag, seq = record.seq, "ROOT flag on a nested frame, treating as KEEP");
        }

        let seq = record.seq;
        let node = FrameNode {
            seq,
            depth,
            label,
            open: record,
            decision: resolution.decision,
            forces_subtree: resolution.forces_subtree,
            open_emitted: false,
            parent,
            buffered: Vec::new(),
        };
        let id = self.alloc(node);

        if is_root {
            let order = self.next_order;
            self.next_order += 1;
            self.trees.insert(
                tag,
                TagTree {
                    root_seq: seq,
                    open: vec![id],
                    pid: tag.pid(),
                    order,
                    last_activity: now,
                    fully_pending: true,
                },
            );
        } else if let Some(tree) = self.trees.get_mut(&tag) {
            tree.open.push(id);
            tree.last_activity = now;
        }

        if resolution.promote_ancestors {
            if let Some(parent) = parent {
                self.promote_chain(tag, parent, out);
            }
        }
        if resolution.decision == Decision::Flush {
            self.emit_frame(tag, id, out);
        }
        Ok(())
    }

    fn on_close(&mut self, record: Record, now: Instant, out: &mut Vec<FlushedEvent>) -> Result<()> {
        let tag = record.tag;

        if let Some(stone) = self.tombstones.get_mut(&tag) {
            self.stats.evicted_records_ignored += 1;
            if stone.root_seq == record.seq {
                self.tombstones.remove(&tag);
            } else {
                stone.last_activity = now;
            }
            return Ok(());
        }

        let Some(tree) = self.trees.get(&tag) else {
            return Err(SeqLogError::ProtocolViolation {
                tag,
                reason: format!("step out of frame {} for an unknown tag", record.seq),
            });
        };
        let Some(index) = tree
            .open
            .iter()
            .rposition(|&id| self.node(id).map(|n| n.seq) == Some(record.seq))
        else {
            return Err(SeqLogError::ProtocolViolation {
                tag,
                reason: format!("step out of frame {} which is not open", record.seq),
            });
        };

        if let Some(tree) = self.trees.get_mut(&tag) {
            tree.last_activity = now;
        }
        self.close_down_to(tag, index, record.timestamp_us, out);
        Ok(())
    }

    fn on_message(&mut self, record: Record, now: Instant, out: &mut Vec<FlushedEvent>) -> Result<()> {
        let tag = record.tag;
        let (level, flag) = match &record.body {
            RecordBody::Message { level, flag, .. } => (*level, *flag),
            _ => return Ok(()),
        };

        if let Some(stone) = self.tombstones.get_mut(&tag) {
            stone.last_activity = now;
            self.stats.evicted_records_ignored += 1;
            return Ok(());
        }

        let Some(tree) = self.trees.get_mut(&tag) else {
            return Err(SeqLogError::ProtocolViolation {
                tag,
                reason: "message for a tag with no open frame".to_string(),
            });
        };
        tree.last_activity = now;

        // The owner is the open frame the producer named, normally the deepest
        let open = tree.open.clone();
        let owner = open
            .iter()
            .rev()
            .copied()
            .find(|&id| self.node(id).map(|n| n.seq) == Some(record.seq))
            .or_else(|| open.last().copied());
        let Some(owner) = owner else {
            return Ok(());
        };

        match self.policy.resolve_message(flag, level) {
            Promotion::Chain => self.promote_chain(tag, owner, out),
            Promotion::Owner => self.promote_one(tag, owner, out),
            Promotion::None => {}
        }

        let Some(node) = self.node_mut(owner) else {
            return Ok(());
        };
        let depth = node.depth + 1;
        if node.decision == Decision::Flush {
            let label = node.label.clone();
            out.push(FlushedEvent::new(record, depth, Some(label)));
            self.mark_emitted(tag);
        } else {
            node.buffered.push(record);
            self.buffered_nodes += 1;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Promotion and resolution
    // ═══════════════════════════════════════════════════════════════════════

    /// Promote `from` and every open ancestor, root first
    fn promote_chain(&mut self, tag: Tag, from: NodeId, out: &mut Vec<FlushedEvent>) {
        let mut chain = Vec::new();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.node(id).and_then(|n| n.parent);
        }
        for id in chain.into_iter().rev() {
            self.promote_one(tag, id, out);
        }
    }

    fn promote_one(&mut self, tag: Tag, id: NodeId, out: &mut Vec<FlushedEvent>) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        if node.decision != Decision::Pending {
            return;
        }
        node.decision = Decision::Flush;
        self.emit_frame(tag, id, out);
    }

    /// Emit a flushed frame's open line and everything it buffered
    fn emit_frame(&mut self, tag: Tag, id: NodeId, out: &mut Vec<FlushedEvent>) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        let buffered = std::mem::take(&mut node.buffered);
        let released = buffered.len();
        let label = node.label.clone();
        let depth = node.depth;

        if !node.open_emitted {
            node.open_emitted = true;
            out.push(FlushedEvent::new(node.open.clone(), depth, Some(label.clone())));
        }
        for message in buffered {
            out.push(FlushedEvent::new(message, depth + 1, Some(label.clone())));
        }

        self.buffered_nodes -= released;
        self.mark_emitted(tag);
    }

    /// Close open frames of `tag` until only `keep` remain
    fn close_down_to(&mut self, tag: Tag, keep: usize, timestamp_us: i64, out: &mut Vec<FlushedEvent>) {
        loop {
            let Some(tree) = self.trees.get_mut(&tag) else {
                return;
            };
            if tree.open.len() <= keep {
                return;
            }
            let Some(id) = tree.open.pop() else {
                return;
            };
            let root_closed = tree.open.is_empty();

            if let Some(node) = self.release(id) {
                match self.policy.resolve_close(node.decision) {
                    Decision::Flush => {
                        out.push(FlushedEvent::new(
                            Record::close(tag, node.seq).at(timestamp_us),
                            node.depth,
                            Some(node.label),
                        ));
                        self.mark_emitted(tag);
                    }
                    _ => {
                        self.stats.nodes_discarded += 1 + node.buffered.len() as u64;
                    }
                }
            }

            if root_closed {
                self.trees.remove(&tag);
                return;
            }
        }
    }

    fn mark_emitted(&mut self, tag: Tag) {
        if let Some(tree) = self.trees.get_mut(&tag) {
            tree.fully_pending = false;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Capacity, reaping and shutdown
    // ═══════════════════════════════════════════════════════════════════════

    fn enforce_capacity(&mut self) {
        while self.buffered_nodes > self.max_nodes {
            let victim = self
                .trees
                .iter()
                .filter(|(_, t)| t.fully_pending)
                .min_by_key(|(_, t)| t.order)
                .map(|(tag, t)| (*tag, t.root_seq, t.last_activity));

            let Some((tag, root_seq, last_activity)) = victim else {
                if !self.capacity_warned {
                    let err = SeqLogError::CapacityExceeded {
                        limit: self.max_nodes,
                    };
                    warn!(buffered = self.buffered_nodes, "{}; no fully pending tree to evict", err);
                    self.capacity_warned = true;
                }
                return;
            };

            let discarded = self.discard_tree(tag);
            self.tombstones.insert(
                tag,
                Tombstone {
                    root_seq,
                    last_activity,
                },
            );
            self.stats.trees_evicted += 1;
            warn!(%tag, discarded, limit = self.max_nodes, "Evicted pending call tree");
        }
        self.capacity_warned = false;
    }

    /// Drop every tag whose producer process is gone and that has been idle
    /// for longer than `idle_timeout`, discarding pending content
    ///
    /// Tags of live producers are never reaped, however long they stay quiet.
    pub fn reap<F>(&mut self, now: Instant, idle_timeout: Duration, is_alive: F) -> usize
    where
        F: Fn(u32) -> bool,
    {
        let expired: Vec<Tag> = self
            .trees
            .iter()
            .filter(|(_, t)| {
                now.saturating_duration_since(t.last_activity) > idle_timeout && !is_alive(t.pid)
            })
            .map(|(tag, _)| *tag)
            .collect();

        for tag in &expired {
            let discarded = self.discard_tree(*tag);
            debug!(%tag, discarded, "Reaped call tree");
        }
        self.stats.tags_reaped += expired.len() as u64;

        self.tombstones.retain(|tag, stone| {
            now.saturating_duration_since(stone.last_activity) <= idle_timeout
                && is_alive(tag.pid())
        });
        expired.len()
    }

    /// Discard everything still buffered; flushed content is already out
    pub fn shutdown(&mut self) -> u64 {
        let tags: Vec<Tag> = self.trees.keys().copied().collect();
        let mut discarded = 0;
        for tag in tags {
            discarded += self.discard_tree(tag);
        }
        self.tombstones.clear();
        discarded
    }

    fn discard_tree(&mut self, tag: Tag) -> u64 {
        let Some(tree) = self.trees.remove(&tag) else {
            return 0;
        };
        let mut discarded = 0;
        for id in tree.open {
            if let Some(node) = self.release(id) {
                if node.decision == Decision::Pending {
                    discarded += 1 + node.buffered.len() as u64;
                }
            }
        }
        self.stats.nodes_discarded += discarded;
        discarded
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Arena
    // ═══════════════════════════════════════════════════════════════════════

    fn alloc(&mut self, node: FrameNode) -> NodeId {
        self.buffered_nodes += 1;
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<FrameNode> {
        let node = self.nodes.get_mut(id)?.take()?;
        self.free.push(id);
        self.buffered_nodes -= 1 + node.buffered.len();
        Some(node)
    }

    fn node(&self, id: NodeId) -> Option<&FrameNode> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut FrameNode> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }
}

impl Default for CallTreeBuffer {
    fn default() -> Self {
        Self::new(FlushPolicy::default(), DEFAULT_MAX_BUFFERED_NODES)
    }
}

/// Whether a producer process still exists
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    if pid > libc::pid_t::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, OutputFlag};

    const PID: u32 = 4000;

    struct Script {
        buffer: CallTreeBuffer,
        tag: Tag,
        seq: u32,
        open: Vec<u32>,
        out: Vec<FlushedEvent>,
        now: Instant,
    }

    impl Script {
        fn new(policy: FlushPolicy) -> Self {
            Self::with_capacity(policy, DEFAULT_MAX_BUFFERED_NODES)
        }

        fn with_capacity(policy: FlushPolicy, max_nodes: usize) -> Self {
            Self {
                buffer: CallTreeBuffer::new(policy, max_nodes),
                tag: Tag::new(PID, 1),
                seq: 0,
                open: Vec::new(),
                out: Vec::new(),
                now: Instant::now(),
            }
        }

        fn step_in(&mut self, class: &str, func: &str, flag: OutputFlag) -> &mut Self {
            self.seq += 1;
            let record = Record::open(self.tag, self.seq, self.open.len() as u16, flag, class, func);
            self.open.push(self.seq);
            self.buffer.apply(record, self.now, &mut self.out).unwrap();
            self
        }

        fn message(&mut self, level: Level, flag: OutputFlag, text: &str) -> &mut Self {
            let seq = *self.open.last().unwrap();
            let record = Record::message(self.tag, seq, level, flag, text);
            self.buffer.apply(record, self.now, &mut self.out).unwrap();
            self
        }

        fn step_out(&mut self) -> &mut Self {
            let seq = self.open.pop().unwrap();
            self.buffer
                .apply(Record::close(self.tag, seq), self.now, &mut self.out)
                .unwrap();
            self
        }

        fn bodies(&self) -> Vec<String> {
            self.out
                .iter()
                .map(|e| {
                    let line = e.format_line();
                    let fields: Vec<&str> = line.splitn(6, ' ').collect();
                    fields[5].trim_start().to_string()
                })
                .collect()
        }
    }

    fn keep_root() -> FlushPolicy {
        FlushPolicy::new(OutputFlag::Keep, false)
    }

    #[test]
    fn test_output_all_message_surfaces_call_path() {
        let mut s = Script::new(keep_root());
        s.step_in("Order", "process", OutputFlag::Keep)
            .message(Level::Debug, OutputFlag::Keep, "validating")
            .step_in("Order", "charge", OutputFlag::Keep)
            .message(Level::Error, OutputFlag::OutputAll, "card declined")
            .step_out()
            .step_out();

        assert_eq!(
            s.bodies(),
            vec![
                "> Order::process",
                "Order::process: validating",
                "> Order::charge",
                "Order::charge: card declined",
                "< Order::charge",
                "< Order::process",
            ]
        );
        assert_eq!(s.buffer.open_tags(), 0);
        assert_eq!(s.buffer.buffered_nodes(), 0);
    }

    #[test]
    fn test_keep_only_tree_writes_nothing() {
        let mut s = Script::new(keep_root());
        s.step_in("Order", "process", OutputFlag::Keep)
            .message(Level::Debug, OutputFlag::Keep, "validating")
            .step_in("Order", "charge", OutputFlag::Keep)
            .message(Level::Error, OutputFlag::Keep, "card declined")
            .step_out()
            .step_out();

        assert!(s.out.is_empty());
        assert_eq!(s.buffer.stats().nodes_discarded, 4);
        assert_eq!(s.buffer.buffered_nodes(), 0);
    }

    #[test]
    fn test_always_tree_written_depth_first() {
        let mut s = Script::new(keep_root());
        s.step_in("A", "root", OutputFlag::Always)
            .message(Level::Info, OutputFlag::Keep, "one")
            .step_in("B", "child", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "two")
            .step_out()
            .message(Level::Info, OutputFlag::Keep, "three")
            .step_out();

        assert_eq!(
            s.bodies(),
            vec![
                "> A::root",
                "A::root: one",
                "> B::child",
                "B::child: two",
                "< B::child",
                "A::root: three",
                "< A::root",
            ]
        );
    }

    #[test]
    fn test_root_flag_resolves_by_configuration() {
        let mut always = Script::new(FlushPolicy::new(OutputFlag::Always, false));
        always.step_in("A", "main", OutputFlag::Root).step_out();
        assert_eq!(always.out.len(), 2);

        let mut keep = Script::new(keep_root());
        keep.step_in("A", "main", OutputFlag::Root).step_out();
        assert!(keep.out.is_empty());
    }

    #[test]
    fn test_output_all_promotes_only_the_path() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep)
            .step_in("S", "sibling", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "quiet")
            .step_out()
            .step_in("P", "path", OutputFlag::Keep)
            .step_in("D", "deep", OutputFlag::Keep)
            .message(Level::Error, OutputFlag::OutputAll, "boom")
            .step_out()
            .step_out()
            .step_in("L", "later", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "after")
            .step_out()
            .step_out();

        let bodies = s.bodies();
        assert_eq!(
            bodies,
            vec![
                "> R::root",
                "> P::path",
                "> D::deep",
                "D::deep: boom",
                "< D::deep",
                "< P::path",
                "< R::root",
            ]
        );
    }

    #[test]
    fn test_output_all_frame_promotes_ancestors_at_step_in() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "before")
            .step_in("X", "audit", OutputFlag::OutputAll)
            .step_in("Y", "inner", OutputFlag::Keep)
            .step_out()
            .step_out()
            .step_out();

        assert_eq!(
            s.bodies(),
            vec![
                "> R::root",
                "R::root: before",
                "> X::audit",
                "> Y::inner",
                "< Y::inner",
                "< X::audit",
                "< R::root",
            ]
        );
    }

    #[test]
    fn test_always_message_promotes_owner_only() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep)
            .step_in("C", "child", OutputFlag::Keep)
            .message(Level::Warn, OutputFlag::Always, "note")
            .step_out()
            .step_out();

        assert_eq!(s.bodies(), vec!["> C::child", "C::child: note", "< C::child"]);
    }

    #[test]
    fn test_promotion_is_monotonic() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep)
            .message(Level::Error, OutputFlag::OutputAll, "first")
            .message(Level::Debug, OutputFlag::Keep, "later keep message")
            .step_out();

        let bodies = s.bodies();
        assert!(bodies.contains(&"R::root: later keep message".to_string()));
        assert_eq!(bodies.last().unwrap(), "< R::root");
    }

    #[test]
    fn test_unmatched_step_out_is_violation_and_ignored() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep);

        let err = s
            .buffer
            .apply(Record::close(s.tag, 99), s.now, &mut s.out)
            .unwrap_err();
        assert_eq!(err.error_code(), "PROTOCOL_VIOLATION");
        assert_eq!(s.buffer.open_tags(), 1);
        assert_eq!(s.buffer.buffered_nodes(), 1);

        let other = Tag::new(PID, 2);
        assert!(s.buffer.apply(Record::close(other, 1), s.now, &mut s.out).is_err());
        assert!(s
            .buffer
            .apply(
                Record::open(other, 2, 3, OutputFlag::Keep, "A", "b"),
                s.now,
                &mut s.out
            )
            .is_err());
    }

    #[test]
    fn test_close_of_ancestor_closes_missed_frames() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Always)
            .step_in("C", "child", OutputFlag::Keep);

        // The child's step out never arrives
        s.buffer
            .apply(Record::close(s.tag, 1), s.now, &mut s.out)
            .unwrap();

        assert_eq!(
            s.bodies(),
            vec!["> R::root", "> C::child", "< C::child", "< R::root"]
        );
        assert_eq!(s.buffer.open_tags(), 0);
    }

    #[test]
    fn test_category_messages_bypass_buffering() {
        let mut buffer = CallTreeBuffer::new(keep_root(), 10);
        let mut out = Vec::new();
        buffer
            .apply(
                Record::category(Tag::new(PID, 0), Level::Info, "boot", "ready"),
                Instant::now(),
                &mut out,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(buffer.open_tags(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_pending_tree() {
        let mut s = Script::with_capacity(keep_root(), 4);
        s.step_in("Old", "a", OutputFlag::Keep)
            .message(Level::Debug, OutputFlag::Keep, "1")
            .message(Level::Debug, OutputFlag::Keep, "2");
        let old_tag = s.tag;

        s.tag = Tag::new(PID, 2);
        let saved_open = std::mem::take(&mut s.open);
        s.step_in("New", "b", OutputFlag::Keep)
            .message(Level::Debug, OutputFlag::Keep, "3");

        let stats = s.buffer.stats();
        assert_eq!(stats.trees_evicted, 1);
        assert_eq!(stats.open_tags, 1);

        // Records for the evicted tag are ignored until its root closes
        s.buffer
            .apply(
                Record::message(old_tag, saved_open[0], Level::Error, OutputFlag::OutputAll, "x"),
                s.now,
                &mut s.out,
            )
            .unwrap();
        s.buffer
            .apply(Record::close(old_tag, saved_open[0]), s.now, &mut s.out)
            .unwrap();
        assert!(s.out.is_empty());
        assert_eq!(s.buffer.stats().evicted_records_ignored, 2);
    }

    #[test]
    fn test_reap_only_idle_tags_of_dead_producers() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Keep);
        s.tag = Tag::new(PID + 1, 1);
        s.open.clear();
        s.step_in("R", "root", OutputFlag::Keep);

        // Producer gone, but not idle long enough yet
        let later = s.now + Duration::from_secs(10);
        let dead = |pid| pid != PID + 1;
        assert_eq!(s.buffer.reap(later, Duration::from_secs(60), dead), 0);
        assert_eq!(s.buffer.open_tags(), 2);

        let much_later = later + Duration::from_secs(120);
        assert_eq!(s.buffer.reap(much_later, Duration::from_secs(60), dead), 1);
        assert_eq!(s.buffer.open_tags(), 1);
        assert_eq!(s.buffer.stats().tags_reaped, 1);
    }

    #[test]
    fn test_quiet_tag_of_live_producer_survives_reaping() {
        let mut s = Script::new(keep_root());
        s.step_in("main", "run", OutputFlag::Always);
        let flushed = s.out.len();

        let later = s.now + Duration::from_secs(301);
        assert_eq!(s.buffer.reap(later, Duration::from_secs(300), |_| true), 0);
        assert_eq!(s.buffer.open_tags(), 1);

        s.now = later;
        s.step_in("main", "tick", OutputFlag::Keep);
        s.step_out().step_out();
        assert_eq!(s.out.len(), flushed + 3);
    }

    #[test]
    fn test_shutdown_discards_pending_only() {
        let mut s = Script::new(keep_root());
        s.step_in("R", "root", OutputFlag::Always)
            .step_in("C", "child", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "streamed");
        let flushed = s.out.len();

        s.tag = Tag::new(PID, 2);
        s.open.clear();
        s.step_in("Q", "quiet", OutputFlag::Keep)
            .message(Level::Info, OutputFlag::Keep, "held");

        assert_eq!(s.buffer.shutdown(), 2);
        assert_eq!(s.out.len(), flushed);
        assert_eq!(s.buffer.open_tags(), 0);
        assert_eq!(s.buffer.buffered_nodes(), 0);
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
