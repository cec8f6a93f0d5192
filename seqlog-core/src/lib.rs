//! # Sequence Log Core
//!
//! A cross-process, hierarchical execution tracer. Client processes record
//! nested step in / step out frames and messages cheaply; the service decides
//! later whether a subtree is worth keeping, typically once something inside
//! it went wrong.
//!
//! ## Architecture
//!
//! ```text
//! producers (any process)                      service process
//! ┌─────────────────────┐                ┌──────────────────────────────┐
//! │ SequenceLog         │   shared ring  │ collector thread             │
//! │  └─ CallStack ──────┼──► (mmap) ────►│  CallTreeBuffer + FlushPolicy│
//! │     step_in/out     │                │        │                     │
//! │     message         │                │        ▼                     │
//! └─────────────────────┘                │  SinkFanout ─► file, screen, │
//!                                        │               live, forward  │
//!                                        └──────────────────────────────┘
//! ```
//!
//! Frames opened with `KEEP` stay buffered until the tag's root closes and
//! are then discarded, unless a descendant surfaces them: `ALWAYS` streams a
//! subtree as it happens, `OUTPUT_ALL` additionally promotes every open
//! ancestor so the full call path is persisted.
//!
//! ## Example
//!
//! ```rust,no_run
//! use seqlog_core::{Level, OutputFlag, SequenceLogService, ServiceConfig};
//!
//! let config = ServiceConfig::default()
//!     .shared_memory_dir("/tmp")
//!     .log_output_dir("/tmp/slog");
//! let service = SequenceLogService::start(config).unwrap();
//!
//! let log = service.client();
//! let mut stack = log.call_stack();
//! let tag = stack.step_in("Order", "process", OutputFlag::Keep).unwrap();
//! stack.step_in("Order", "charge", OutputFlag::Keep).unwrap();
//! stack
//!     .message_with(tag, Level::Error, OutputFlag::OutputAll, "card declined")
//!     .unwrap();
//! stack.step_out(tag).unwrap();
//! stack.step_out(tag).unwrap();
//!
//! service.shutdown();
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod policy;
pub mod record;
pub mod rotation;
pub mod service;
pub mod sink;
pub mod tree;

// Re-export main types
pub use channel::{ChannelConfig, ChannelStats, OverflowPolicy, SharedChannel};
pub use client::{CallStack, SequenceLog};
pub use config::{ServiceConfig, DEFAULT_CONFIG_PATH};
pub use error::{ErrorCategory, ErrorDetail, ErrorResponse, Result, SeqLogError};
pub use event::{FlushedEvent, FrameLabel};
pub use policy::{Decision, FlushPolicy};
pub use record::{Ident, Level, OutputFlag, Record, RecordBody, Scope, Tag};
pub use rotation::{RotationManager, SegmentInfo};
pub use service::{SequenceLogService, ServiceHandle, ServiceStats};
pub use sink::{MemorySink, SinkFanout, SinkStats, TraceSink};
pub use tree::{CallTreeBuffer, TreeStats};

/// Binary record layout version
pub const RECORD_VERSION: u8 = codec::CODEC_VERSION;
