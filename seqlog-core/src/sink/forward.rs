//! Forwarding flushed records to a remote collector
//!
//! The stream carries length-prefixed frames, each holding one record in the
//! channel's binary encoding:
//!
//! ```text
//! u32 frame_len (little-endian) | encoded record
//! ```
//!
//! The connection is opened lazily on the first write and reopened after any
//! failure; the fan-out's retry backoff paces the attempts. Frames sent by the
//! collector are read on a separate thread and reported to the listener.
//! A batch interrupted by a failure is sent again in full, so delivery is
//! at least once.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::TraceSink;
use crate::codec::{self, MAX_RECORD_LEN};
use crate::error::{Result, SeqLogError};
use crate::event::FlushedEvent;
use crate::record::Record;

/// Connection-level events visible to the forwarding client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    Open,
    Close,
    Error(String),
    /// One inbound frame, still encoded
    Message(Vec<u8>),
}

/// Receives connection events of a [`ForwardSink`]
pub trait ForwardListener: Send + 'static {
    fn on_open(&mut self) {}

    fn on_close(&mut self) {}

    fn on_error(&mut self, _error: &str) {}

    fn on_message(&mut self, _frame: &[u8]) {}

    fn handle(&mut self, event: ForwardEvent) {
        match event {
            ForwardEvent::Open => self.on_open(),
            ForwardEvent::Close => self.on_close(),
            ForwardEvent::Error(e) => self.on_error(&e),
            ForwardEvent::Message(frame) => self.on_message(&frame),
        }
    }
}

/// Listener that reports connection events through `tracing`
#[derive(Debug, Default)]
pub struct LoggingListener;

impl ForwardListener for LoggingListener {
    fn on_open(&mut self) {
        info!("Connected to remote collector");
    }

    fn on_close(&mut self) {
        info!("Remote collector closed the connection");
    }

    fn on_error(&mut self, error: &str) {
        warn!(error, "Remote collector connection error");
    }

    fn on_message(&mut self, frame: &[u8]) {
        debug!(bytes = frame.len(), "Frame from remote collector");
    }
}

/// Remote forwarder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSinkConfig {
    /// Collector address, `host:port`
    pub address: String,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl ForwardSinkConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

type SharedListener = Arc<Mutex<Box<dyn ForwardListener>>>;

struct Connection {
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

/// Sink that streams records to a remote collector over TCP
pub struct ForwardSink {
    config: ForwardSinkConfig,
    listener: SharedListener,
    connection: Option<Connection>,
    buf: Vec<u8>,
}

impl ForwardSink {
    pub fn new(config: ForwardSinkConfig) -> Self {
        Self::with_listener(config, LoggingListener)
    }

    pub fn with_listener<L: ForwardListener>(config: ForwardSinkConfig, listener: L) -> Self {
        Self {
            config,
            listener: Arc::new(Mutex::new(Box::new(listener))),
            connection: None,
            buf: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn notify(&self, event: ForwardEvent) {
        self.listener.lock().handle(event);
    }

    fn unavailable(&self, reason: impl Into<String>) -> SeqLogError {
        SeqLogError::SinkUnavailable {
            sink: "forward".to_string(),
            reason: reason.into(),
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        self.config
            .address
            .to_socket_addrs()
            .map_err(|e| self.unavailable(format!("cannot resolve {}: {}", self.config.address, e)))?
            .next()
            .ok_or_else(|| self.unavailable(format!("{} resolved to nothing", self.config.address)))
    }

    fn connect(&mut self) -> Result<()> {
        let addr = self.resolve()?;
        let stream = match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
            Ok(stream) => stream,
            Err(e) => {
                let reason = format!("connect to {} failed: {}", addr, e);
                self.notify(ForwardEvent::Error(reason.clone()));
                return Err(self.unavailable(reason));
            }
        };
        stream.set_nodelay(true)?;

        let reader_stream = stream.try_clone()?;
        let listener = Arc::clone(&self.listener);
        let reader = thread::Builder::new()
            .name("seqlog-forward-reader".to_string())
            .spawn(move || read_inbound(reader_stream, listener))?;

        self.connection = Some(Connection {
            stream,
            reader: Some(reader),
        });
        self.notify(ForwardEvent::Open);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.stream.shutdown(Shutdown::Both);
            if let Some(reader) = connection.reader.take() {
                let _ = reader.join();
            }
        }
    }
}

impl TraceSink for ForwardSink {
    fn name(&self) -> &str {
        "forward"
    }

    fn write(&mut self, events: &[FlushedEvent]) -> Result<()> {
        if self.connection.is_none() {
            self.connect()?;
        }

        self.buf.clear();
        for event in events {
            let start = self.buf.len();
            self.buf.extend_from_slice(&[0; 4]);
            codec::encode_into(&event.record, &mut self.buf);
            let len = (self.buf.len() - start - 4) as u32;
            self.buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }

        let result = match self.connection.as_mut() {
            Some(connection) => connection.stream.write_all(&self.buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        if let Err(e) = result {
            let reason = format!("write failed: {}", e);
            self.notify(ForwardEvent::Error(reason.clone()));
            self.disconnect();
            return Err(self.unavailable(reason));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut() {
            connection.stream.flush()?;
        }
        Ok(())
    }
}

impl Drop for ForwardSink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_inbound(stream: TcpStream, listener: SharedListener) {
    let mut reader = FrameReader::new(stream);
    loop {
        match reader.read_frame() {
            Ok(Some(frame)) => listener.lock().handle(ForwardEvent::Message(frame)),
            Ok(None) => {
                listener.lock().handle(ForwardEvent::Close);
                return;
            }
            Err(e) => {
                listener.lock().handle(ForwardEvent::Error(e.to_string()));
                return;
            }
        }
    }
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(out: &mut W, frame: &[u8]) -> io::Result<()> {
    out.write_all(&(frame.len() as u32).to_le_bytes())?;
    out.write_all(frame)
}

/// Splits a byte stream back into frames (collector side)
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next raw frame; `None` on a clean end of stream between frames
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match self.inner.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(SeqLogError::corrupt("stream ended inside a frame header"));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(SeqLogError::corrupt(format!(
                "frame of {} bytes exceeds {}",
                len, MAX_RECORD_LEN
            )));
        }
        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SeqLogError::corrupt("stream ended inside a frame")
            } else {
                e.into()
            }
        })?;
        Ok(Some(frame))
    }

    /// Next decoded record
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        match self.read_frame()? {
            Some(frame) => codec::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FrameLabel;
    use crate::record::{Level, OutputFlag, Tag};
    use std::net::TcpListener;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<ForwardEvent>>>,
    }

    impl ForwardListener for Recorder {
        fn handle(&mut self, event: ForwardEvent) {
            self.seen.lock().push(event);
        }
    }

    fn events() -> Vec<FlushedEvent> {
        let tag = Tag::new(55, 1);
        let label = Some(FrameLabel::new("Order".into(), "process".into()));
        vec![
            FlushedEvent::new(
                Record::open(tag, 1, 0, OutputFlag::Always, "Order", "process"),
                0,
                label.clone(),
            ),
            FlushedEvent::new(
                Record::message(tag, 1, Level::Warn, OutputFlag::Keep, "slow"),
                1,
                label,
            ),
        ]
    }

    #[test]
    fn test_frame_reader_roundtrip_and_eof() {
        let record = Record::close(Tag::new(1, 1), 4);
        let mut stream = Vec::new();
        write_frame(&mut stream, &codec::encode(&record)).unwrap();

        let mut reader = FrameReader::new(stream.as_slice());
        assert_eq!(reader.read_record().unwrap(), Some(record));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn test_frame_reader_rejects_truncated_and_oversized() {
        let mut reader = FrameReader::new(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(reader.read_frame().is_err());

        let huge = (MAX_RECORD_LEN as u32 + 1).to_le_bytes();
        let mut reader = FrameReader::new(&huge[..]);
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn test_forwards_records_and_receives_replies() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let collector = thread::spawn(move || {
            let (mut conn, _) = server.accept().unwrap();
            let mut reader = FrameReader::new(conn.try_clone().unwrap());
            let first = reader.read_record().unwrap().unwrap();
            let second = reader.read_record().unwrap().unwrap();
            write_frame(&mut conn, b"ack").unwrap();
            (first, second)
        });

        let recorder = Recorder::default();
        let mut sink = ForwardSink::with_listener(ForwardSinkConfig::new(addr.to_string()), recorder.clone());
        sink.write(&events()).unwrap();
        assert!(sink.is_connected());

        let (first, second) = collector.join().unwrap();
        assert!(first.is_open());
        assert_eq!(second.tag, Tag::new(55, 1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.seen.lock().contains(&ForwardEvent::Message(b"ack".to_vec())) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(recorder.seen.lock()[0], ForwardEvent::Open);
    }

    #[test]
    fn test_unreachable_collector_reports_error() {
        let addr = {
            let vacant = TcpListener::bind("127.0.0.1:0").unwrap();
            vacant.local_addr().unwrap()
        };

        let recorder = Recorder::default();
        let mut sink = ForwardSink::with_listener(
            ForwardSinkConfig::new(addr.to_string()).connect_timeout(Duration::from_millis(200)),
            recorder.clone(),
        );
        let err = sink.write(&events()).unwrap_err();
        assert_eq!(err.error_code(), "SINK_UNAVAILABLE");
        assert!(!sink.is_connected());
        assert!(matches!(recorder.seen.lock()[0], ForwardEvent::Error(_)));
    }
}
