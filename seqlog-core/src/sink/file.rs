//! Durable sink writing formatted lines into rotating segments

use std::sync::Arc;

use parking_lot::Mutex;

use super::TraceSink;
use crate::error::Result;
use crate::event::FlushedEvent;
use crate::rotation::{RotationManager, SegmentInfo};

/// Writes each event as one text line through a [`RotationManager`]
///
/// The manager is shared so the service can list segments while the sink
/// worker owns the writing side. When a batch fails partway, a retry of the
/// same batch skips the lines already written.
pub struct RotatingFileSink {
    rotation: Arc<Mutex<RotationManager>>,
    /// Leading events of the failed batch that are already on disk
    resume: usize,
}

impl RotatingFileSink {
    pub fn new(rotation: RotationManager) -> Self {
        Self {
            rotation: Arc::new(Mutex::new(rotation)),
            resume: 0,
        }
    }

    /// Handle for listing segments from another thread
    pub fn rotation(&self) -> Arc<Mutex<RotationManager>> {
        Arc::clone(&self.rotation)
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.rotation.lock().segments()
    }
}

impl TraceSink for RotatingFileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write(&mut self, events: &[FlushedEvent]) -> Result<()> {
        let mut rotation = self.rotation.lock();
        for event in events.iter().skip(self.resume) {
            rotation.write_line(&event.format_line())?;
            self.resume += 1;
        }
        self.resume = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.rotation.lock().flush()
    }

    fn abandon_batch(&mut self) {
        self.resume = 0;
    }
}
