//! Sink fan-out
//!
//! Flushed events leave the collector in batches and are handed to every
//! registered sink through its own bounded queue and worker thread:
//!
//! ```text
//! collector ──► SinkFanout::dispatch ──┬─► queue ─► worker ─► RotatingFileSink
//!                                      ├─► queue ─► worker ─► BroadcastSink
//!                                      ├─► queue ─► worker ─► ForwardSink
//!                                      └─► queue ─► worker ─► ScreenSink
//! ```
//!
//! A full queue drops its oldest batch rather than blocking the collector,
//! and a failing sink retries with exponential backoff on its own thread,
//! so one slow or broken sink never holds up the others.

mod broadcast;
mod file;
mod forward;
mod screen;

pub use broadcast::BroadcastSink;
pub use file::RotatingFileSink;
pub use forward::{
    write_frame, ForwardEvent, ForwardListener, ForwardSink, ForwardSinkConfig, FrameReader,
    LoggingListener,
};
pub use screen::ScreenSink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::FlushedEvent;

/// Default per-sink queue length, in batches
pub const DEFAULT_SINK_QUEUE_SIZE: usize = 4096;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const IDLE_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// A delivery target for flushed events
pub trait TraceSink: Send + 'static {
    /// Short name used in logs and stats
    fn name(&self) -> &str;

    /// Write a batch of events, in order
    ///
    /// A failed batch is retried with the same events until it succeeds or
    /// [`abandon_batch`](TraceSink::abandon_batch) is called.
    fn write(&mut self, events: &[FlushedEvent]) -> Result<()>;

    /// Flush any pending writes
    fn flush(&mut self) -> Result<()>;

    /// The batch that last failed will not be retried
    fn abandon_batch(&mut self) {}
}

/// In-memory sink for testing
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<FlushedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlushedEvent> {
        self.events.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Formatted lines with the timestamp, level, pid and tag columns removed
    pub fn bodies(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| {
                let line = e.format_line();
                line.splitn(6, ' ')
                    .nth(5)
                    .map(|rest| rest.trim_start().to_string())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl TraceSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, events: &[FlushedEvent]) -> Result<()> {
        self.events.lock().extend(events.iter().cloned());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Delivery counters of one sink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkStats {
    pub name: String,
    /// Events written successfully
    pub delivered: u64,
    /// Events dropped because the queue was full
    pub dropped: u64,
    /// Failed write attempts
    pub failures: u64,
    /// Batches waiting in the queue
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
}

type Batch = Arc<Vec<FlushedEvent>>;

struct Worker {
    name: String,
    sender: Sender<Batch>,
    // Held so the dispatcher can pop the oldest batch when the queue is full
    receiver: Receiver<Batch>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

/// Fans batches out to sinks, one worker thread per sink
pub struct SinkFanout {
    queue_size: usize,
    workers: Vec<Worker>,
    stop: Option<Sender<()>>,
    stop_signal: Receiver<()>,
}

impl SinkFanout {
    pub fn new(queue_size: usize) -> Self {
        let (stop, stop_signal) = channel::bounded(0);
        Self {
            queue_size: queue_size.max(1),
            workers: Vec::new(),
            stop: Some(stop),
            stop_signal,
        }
    }

    /// Register a sink and start its worker
    pub fn add<S: TraceSink>(&mut self, sink: S) -> Result<()> {
        let name = sink.name().to_string();
        let (sender, receiver) = channel::bounded(self.queue_size);
        let counters = Arc::new(Counters::default());

        let handle = {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let stop_signal = self.stop_signal.clone();
            thread::Builder::new()
                .name(format!("seqlog-sink-{}", name))
                .spawn(move || worker_loop(sink, receiver, counters, stop_signal))?
        };

        debug!(sink = %name, queue_size = self.queue_size, "Started sink worker");
        self.workers.push(Worker {
            name,
            sender,
            receiver,
            counters,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Queue a batch for every sink; never blocks
    pub fn dispatch(&self, events: Vec<FlushedEvent>) {
        if events.is_empty() {
            return;
        }
        let batch: Batch = Arc::new(events);
        for worker in &self.workers {
            let mut pending = Arc::clone(&batch);
            loop {
                match worker.sender.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(returned)) => {
                        pending = returned;
                        if let Ok(oldest) = worker.receiver.try_recv() {
                            worker
                                .counters
                                .dropped
                                .fetch_add(oldest.len() as u64, Ordering::Relaxed);
                            warn!(
                                sink = %worker.name,
                                dropped = oldest.len(),
                                "Sink queue full, dropped oldest batch"
                            );
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
    }

    pub fn stats(&self) -> Vec<SinkStats> {
        self.workers
            .iter()
            .map(|w| SinkStats {
                name: w.name.clone(),
                delivered: w.counters.delivered.load(Ordering::Relaxed),
                dropped: w.counters.dropped.load(Ordering::Relaxed),
                failures: w.counters.failures.load(Ordering::Relaxed),
                queued: w.sender.len(),
            })
            .collect()
    }

    /// Let every worker drain its queue, flush its sink, and exit
    ///
    /// Returns the final counters of every sink.
    pub fn shutdown(mut self) -> Vec<SinkStats> {
        self.stop_workers()
    }

    fn stop_workers(&mut self) -> Vec<SinkStats> {
        let workers = std::mem::take(&mut self.workers);
        // Dropping both queue ends held here disconnects each queue once drained
        let stopping: Vec<(String, Option<JoinHandle<()>>, Arc<Counters>)> = workers
            .into_iter()
            .map(|w| (w.name, w.handle, w.counters))
            .collect();
        self.stop.take();

        let mut stats = Vec::with_capacity(stopping.len());
        for (name, handle, counters) in stopping {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(sink = %name, "Sink worker panicked");
                }
            }
            stats.push(SinkStats {
                delivered: counters.delivered.load(Ordering::Relaxed),
                dropped: counters.dropped.load(Ordering::Relaxed),
                failures: counters.failures.load(Ordering::Relaxed),
                queued: 0,
                name,
            });
        }
        stats
    }
}

impl Drop for SinkFanout {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop<S: TraceSink>(
    mut sink: S,
    receiver: Receiver<Batch>,
    counters: Arc<Counters>,
    stop_signal: Receiver<()>,
) {
    let mut dirty = false;
    loop {
        match receiver.recv_timeout(IDLE_FLUSH_INTERVAL) {
            Ok(batch) => {
                if deliver(&mut sink, &batch, &counters, &stop_signal) {
                    dirty = true;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if dirty {
                    flush_sink(&mut sink, &counters);
                    dirty = false;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    flush_sink(&mut sink, &counters);
    debug!(sink = %sink.name(), "Sink worker stopped");
}

/// Write one batch, retrying with backoff until it succeeds or the fan-out
/// is shutting down
fn deliver<S: TraceSink>(
    sink: &mut S,
    batch: &[FlushedEvent],
    counters: &Counters,
    stop_signal: &Receiver<()>,
) -> bool {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match sink.write(batch) {
            Ok(()) => {
                counters
                    .delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                return true;
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sink = %sink.name(),
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Sink write failed"
                );
                // Returns early once the fan-out drops its stop sender
                if let Err(RecvTimeoutError::Disconnected) = stop_signal.recv_timeout(backoff) {
                    warn!(sink = %sink.name(), events = batch.len(), "Giving up on batch at shutdown");
                    sink.abandon_batch();
                    return false;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn flush_sink<S: TraceSink>(sink: &mut S, counters: &Counters) {
    if let Err(e) = sink.flush() {
        counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(sink = %sink.name(), error = %e, "Sink flush failed");
    }
}
