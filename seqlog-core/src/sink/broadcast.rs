//! Live broadcast of formatted lines to connected viewers

use tokio::sync::broadcast;

use super::TraceSink;
use crate::error::Result;
use crate::event::FlushedEvent;

/// Publishes every line on a tokio broadcast channel
///
/// Viewers that fall behind lose the oldest lines (they observe
/// `RecvError::Lagged`); having no viewers at all is not an error.
pub struct BroadcastSink {
    sender: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }

    /// Create a channel holding up to `capacity` unread lines per viewer
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.sender.clone()
    }
}

impl TraceSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn write(&mut self, events: &[FlushedEvent]) -> Result<()> {
        for event in events {
            // Err only means nobody is listening right now
            let _ = self.sender.send(event.format_line());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, OutputFlag, Record, Tag};

    fn event(text: &str) -> FlushedEvent {
        FlushedEvent::new(
            Record::message(Tag::new(3, 1), 1, Level::Info, OutputFlag::Keep, text),
            1,
            None,
        )
    }

    #[test]
    fn test_viewers_receive_lines() {
        let mut sink = BroadcastSink::with_capacity(8);
        let mut viewer = sink.subscribe();

        sink.write(&[event("hello")]).unwrap();
        assert!(viewer.try_recv().unwrap().ends_with("hello"));
    }

    #[test]
    fn test_no_viewers_is_fine() {
        let mut sink = BroadcastSink::with_capacity(8);
        assert!(sink.write(&[event("nobody")]).is_ok());
    }

    #[test]
    fn test_slow_viewer_lags() {
        let mut sink = BroadcastSink::with_capacity(2);
        let mut viewer = sink.subscribe();

        sink.write(&[event("a"), event("b"), event("c")]).unwrap();
        assert!(matches!(
            viewer.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert!(viewer.try_recv().unwrap().ends_with("b"));
    }
}
