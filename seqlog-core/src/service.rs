//! Service lifecycle
//!
//! [`SequenceLogService`] owns everything the collector needs: the channel
//! segment, the call-tree buffer and the sink fan-out. Starting it spawns a
//! single collector thread:
//!
//! ```text
//! loop {
//!     drain channel ─► CallTreeBuffer::apply ─► SinkFanout::dispatch
//!     every second: reap idle tags of dead producers
//!     sleep poll_interval when the channel was empty
//! }
//! ```
//!
//! On shutdown the collector drains the channel one last time, delivers what
//! was flushed, discards every still pending tree, and waits for the sinks
//! to empty their queues. The segment file is removed afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelStats, SharedChannel};
use crate::client::SequenceLog;
use crate::config::ServiceConfig;
use crate::error::{Result, SeqLogError};
use crate::rotation::{RotationManager, SegmentInfo};
use crate::sink::{
    BroadcastSink, ForwardSink, ForwardSinkConfig, RotatingFileSink, ScreenSink, SinkFanout,
    SinkStats, TraceSink,
};
use crate::tree::{process_alive, CallTreeBuffer, TreeStats};

/// Lines a live viewer may fall behind before losing the oldest
pub const BROADCAST_CAPACITY: usize = 1024;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Counters of a running (or stopped) service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Records decoded from the channel
    pub records_received: u64,
    /// Records dropped because they failed to decode
    pub corrupt_records: u64,
    /// Records ignored as protocol violations
    pub protocol_violations: u64,
    /// Buffered nodes thrown away when the service stopped
    pub discarded_at_shutdown: u64,
    pub tree: TreeStats,
    pub channel: ChannelStats,
    pub sinks: Vec<SinkStats>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A configured service that has not started collecting yet
pub struct SequenceLogService {
    config: ServiceConfig,
    channel: Arc<SharedChannel>,
    rotation: Arc<Mutex<RotationManager>>,
    broadcast: broadcast::Sender<String>,
    fanout: SinkFanout,
}

impl SequenceLogService {
    /// Create the output directory and channel segment, then start
    /// collecting
    pub fn start(config: ServiceConfig) -> Result<ServiceHandle> {
        Self::new(config)?.spawn()
    }

    /// Prepare the service with the sinks its configuration asks for
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let rotation = RotationManager::open(
            &config.log_output_dir,
            config.max_file_size,
            config.max_file_count,
        )?;
        let channel = Self::create_channel(&config)?;
        Self::with_parts(config, channel, rotation)
    }

    /// Create the channel segment file for this process
    pub fn create_channel(config: &ServiceConfig) -> Result<SharedChannel> {
        fs::create_dir_all(&config.shared_memory_dir)?;
        let path = SharedChannel::segment_path(&config.shared_memory_dir, std::process::id());
        SharedChannel::create(&path, &config.channel_config())
    }

    /// Assemble the service from a channel and rotation manager built by
    /// the caller
    pub fn with_parts(
        config: ServiceConfig,
        channel: SharedChannel,
        rotation: RotationManager,
    ) -> Result<Self> {
        let file_sink = RotatingFileSink::new(rotation);
        let rotation = file_sink.rotation();
        let broadcast_sink = BroadcastSink::with_capacity(BROADCAST_CAPACITY);
        let broadcast = broadcast_sink.sender();

        let mut fanout = SinkFanout::new(config.sink_queue_size);
        fanout.add(file_sink)?;
        fanout.add(broadcast_sink)?;
        if config.output_screen {
            fanout.add(ScreenSink::stdout())?;
        }
        if let Some(address) = config.forward_address() {
            info!(%address, "Forwarding flushed records to remote collector");
            fanout.add(ForwardSink::new(ForwardSinkConfig::new(address)))?;
        }

        Ok(Self {
            config,
            channel: Arc::new(channel),
            rotation,
            broadcast,
            fanout,
        })
    }

    /// Register an additional sink
    pub fn add_sink<S: TraceSink>(&mut self, sink: S) -> Result<()> {
        self.fanout.add(sink)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn channel_path(&self) -> Option<&Path> {
        self.channel.path()
    }

    /// Start the collector thread
    pub fn spawn(self) -> Result<ServiceHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let started_at = Utc::now();
        let stats = Arc::new(RwLock::new(ServiceStats {
            started_at: Some(started_at),
            channel: self.channel.stats(),
            sinks: self.fanout.stats(),
            ..Default::default()
        }));

        let collector = Collector {
            channel: Arc::clone(&self.channel),
            tree: CallTreeBuffer::new(self.config.flush_policy(), self.config.max_buffered_nodes),
            fanout: self.fanout,
            stats: Arc::clone(&stats),
            shutdown: Arc::clone(&shutdown),
            idle_timeout: self.config.tag_idle_timeout,
            poll_interval: self.config.poll_interval,
            records_received: 0,
            corrupt_records: 0,
            protocol_violations: 0,
        };

        let handle = thread::Builder::new()
            .name("seqlog-collector".to_string())
            .spawn(move || collector.run())?;

        info!(
            channel = ?self.channel.path(),
            capacity = self.channel.capacity(),
            output_dir = %self.config.log_output_dir.display(),
            "Sequence log service started"
        );

        Ok(ServiceHandle {
            channel: self.channel,
            rotation: self.rotation,
            broadcast: self.broadcast,
            stats,
            shutdown,
            handle: Some(handle),
        })
    }
}

/// Control handle of a running service
pub struct ServiceHandle {
    channel: Arc<SharedChannel>,
    rotation: Arc<Mutex<RotationManager>>,
    broadcast: broadcast::Sender<String>,
    stats: Arc<RwLock<ServiceStats>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<ServiceStats>>,
}

impl ServiceHandle {
    /// Latest counters; channel counters are read live
    pub fn stats(&self) -> ServiceStats {
        let mut stats = self.stats.read().clone();
        stats.channel = self.channel.stats();
        stats
    }

    /// Segment file producers attach to
    pub fn channel_path(&self) -> Option<PathBuf> {
        self.channel.path().map(Path::to_path_buf)
    }

    /// Producer handle sharing this process's mapping of the channel
    pub fn client(&self) -> SequenceLog {
        SequenceLog::in_process(Arc::clone(&self.channel))
    }

    /// Receive every flushed line as it is written
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast.subscribe()
    }

    /// Retained log segments, oldest first
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.rotation.lock().segments()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop collecting and wait for the sinks to finish
    pub fn shutdown(mut self) -> ServiceStats {
        self.stop()
    }

    fn stop(&mut self) -> ServiceStats {
        self.shutdown.store(true, Ordering::Release);
        let mut stats = match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(stats) => stats,
                Err(_) => {
                    error!("Collector thread panicked");
                    self.stats.read().clone()
                }
            },
            None => self.stats.read().clone(),
        };
        stats.channel = self.channel.stats();

        if let Some(path) = self.channel.path() {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed channel segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove channel segment"),
            }
        }
        stats
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

struct Collector {
    channel: Arc<SharedChannel>,
    tree: CallTreeBuffer,
    fanout: SinkFanout,
    stats: Arc<RwLock<ServiceStats>>,
    shutdown: Arc<AtomicBool>,
    idle_timeout: Duration,
    poll_interval: Duration,
    records_received: u64,
    corrupt_records: u64,
    protocol_violations: u64,
}

impl Collector {
    fn run(mut self) -> ServiceStats {
        let mut last_reap = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            let drained = self.drain_once();

            let now = Instant::now();
            if now.duration_since(last_reap) >= REAP_INTERVAL {
                let reaped = self.tree.reap(now, self.idle_timeout, process_alive);
                if reaped > 0 {
                    info!(reaped, "Reaped abandoned call trees");
                }
                last_reap = now;
            }

            self.publish();
            if drained == 0 {
                thread::sleep(self.poll_interval);
            }
        }

        self.drain_once();
        let discarded = self.tree.shutdown();
        if discarded > 0 {
            info!(discarded, "Discarded pending call trees at shutdown");
        }

        let Collector {
            fanout,
            tree,
            channel,
            records_received,
            corrupt_records,
            protocol_violations,
            stats,
            ..
        } = self;
        let sinks = fanout.shutdown();
        let started_at = stats.read().started_at;

        let final_stats = ServiceStats {
            records_received,
            corrupt_records,
            protocol_violations,
            discarded_at_shutdown: discarded,
            tree: tree.stats(),
            channel: channel.stats(),
            sinks,
            started_at,
        };
        *stats.write() = final_stats.clone();
        info!(
            records = final_stats.records_received,
            flushed = final_stats.tree.events_flushed,
            "Sequence log service stopped"
        );
        final_stats
    }

    fn drain_once(&mut self) -> usize {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut drained = 0;

        for item in self.channel.drain() {
            drained += 1;
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    self.corrupt_records += 1;
                    warn!(error = %e, total = self.corrupt_records, "Dropped corrupt record");
                    continue;
                }
            };
            self.records_received += 1;

            match self.tree.apply(record, now, &mut out) {
                Ok(()) => {}
                Err(SeqLogError::ProtocolViolation { tag, reason }) => {
                    self.protocol_violations += 1;
                    warn!(%tag, %reason, "Ignoring protocol violation");
                }
                Err(e) => warn!(error = %e, "Failed to apply record"),
            }
        }

        self.fanout.dispatch(out);
        drained
    }

    fn publish(&self) {
        let mut stats = self.stats.write();
        stats.records_received = self.records_received;
        stats.corrupt_records = self.corrupt_records;
        stats.protocol_violations = self.protocol_violations;
        stats.tree = self.tree.stats();
        stats.channel = self.channel.stats();
        stats.sinks = self.fanout.stats();
    }
}
