//! Flush policy
//!
//! Decides, from output flags alone, what happens to buffered frames:
//!
//! | flag | at step in | as a message flag |
//! |------|------------|-------------------|
//! | `KEEP` | pending | no promotion |
//! | `ALWAYS` | flush, with the whole subtree | promote the owning frame |
//! | `OUTPUT_ALL` | flush the subtree and promote every open ancestor | promote the owner and every open ancestor |
//! | `ROOT` | `ALWAYS` or `KEEP` per configuration (root frames only) | same as `KEEP` |
//!
//! A frame still pending when it closes can never be promoted afterwards,
//! because promotion only walks the open ancestor chain, so it resolves to
//! discard right there. Decisions only ever move from pending to flush or
//! discard; a resolved frame is never revisited.
//!
//! Severity plays no part unless `error_promotes` is enabled, in which case
//! an `ERROR` message acts as if it carried `OUTPUT_ALL`.

use serde::{Deserialize, Serialize};

use crate::record::{Level, OutputFlag};

/// Resolution state of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Flush,
    Discard,
}

/// Outcome of evaluating a step in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResolution {
    pub decision: Decision,
    /// Every frame opened beneath this one is flushed as well
    pub forces_subtree: bool,
    /// Open ancestors must be promoted now
    pub promote_ancestors: bool,
    /// The flag after `ROOT` has been resolved
    pub effective_flag: OutputFlag,
    /// `ROOT` was used on a nested frame and treated as `KEEP`
    pub misplaced_root: bool,
}

/// Which frames a message promotes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    None,
    Owner,
    Chain,
}

/// Output-flag evaluation, configured once at service start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// What `ROOT` means on a root frame: `Always` or `Keep`
    pub root_flag: OutputFlag,
    /// Treat every `ERROR` message as `OUTPUT_ALL`
    pub error_promotes: bool,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            root_flag: OutputFlag::Always,
            error_promotes: false,
        }
    }
}

impl FlushPolicy {
    pub fn new(root_flag: OutputFlag, error_promotes: bool) -> Self {
        let root_flag = match root_flag {
            OutputFlag::Always => OutputFlag::Always,
            _ => OutputFlag::Keep,
        };
        Self {
            root_flag,
            error_promotes,
        }
    }

    /// Evaluate a frame at step in
    ///
    /// `parent_forces` is true when an enclosing frame was itself opened
    /// with `ALWAYS`/`OUTPUT_ALL` (or sits beneath one).
    pub fn resolve_open(&self, flag: OutputFlag, is_root: bool, parent_forces: bool) -> OpenResolution {
        let misplaced_root = flag == OutputFlag::Root && !is_root;
        let effective_flag = match flag {
            OutputFlag::Root if is_root => self.root_flag,
            OutputFlag::Root => OutputFlag::Keep,
            other => other,
        };

        let (decision, forces_subtree, promote_ancestors) = match effective_flag {
            _ if parent_forces => (Decision::Flush, true, false),
            OutputFlag::Always => (Decision::Flush, true, false),
            OutputFlag::OutputAll => (Decision::Flush, true, !is_root),
            _ => (Decision::Pending, false, false),
        };

        OpenResolution {
            decision,
            forces_subtree,
            promote_ancestors,
            effective_flag,
            misplaced_root,
        }
    }

    /// Evaluate a message flag
    pub fn resolve_message(&self, flag: OutputFlag, level: Level) -> Promotion {
        if self.error_promotes && level == Level::Error {
            return Promotion::Chain;
        }
        match flag {
            OutputFlag::OutputAll => Promotion::Chain,
            OutputFlag::Always => Promotion::Owner,
            OutputFlag::Keep | OutputFlag::Root => Promotion::None,
        }
    }

    /// Final decision for a frame that is closing
    pub fn resolve_close(&self, current: Decision) -> Decision {
        match current {
            Decision::Pending => Decision::Discard,
            resolved => resolved,
        }
    }
}
