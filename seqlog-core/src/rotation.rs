//! Rotating log segments
//!
//! Formatted lines go into `seqlog-<YYYYMMDD-HHMMSS-mmm>-<n>.log` files in
//! the output directory. A new segment starts before a line would push the
//! current one past `max_file_size`, and the oldest segments are removed once
//! more than `max_file_count` exist. Either limit set to 0 means unlimited.
//! A line that cannot fit even an empty segment is truncated to fit.
//!
//! Segments already present at startup are picked up (ordered by
//! modification time, then name) and count toward the limit. Only files
//! following the segment naming are ever touched.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SeqLogError};

const SEGMENT_PATTERN: &str = "seqlog-*.log";

/// A retained segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

struct CurrentSegment {
    writer: BufWriter<File>,
    size: u64,
}

/// Writes lines into size- and count-limited segments
pub struct RotationManager {
    dir: PathBuf,
    max_file_size: u64,
    max_file_count: usize,
    segments: VecDeque<SegmentInfo>,
    current: Option<CurrentSegment>,
    opened: u64,
}

impl RotationManager {
    /// Prepare `dir`, creating it if needed, and enumerate existing segments
    pub fn open<P: Into<PathBuf>>(dir: P, max_file_size: u64, max_file_count: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let segments = existing_segments(&dir)?;
        debug!(dir = %dir.display(), existing = segments.len(), "Opened log directory");

        Ok(Self {
            dir,
            max_file_size,
            max_file_count,
            segments: segments.into(),
            current: None,
            opened: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one line (a newline is added)
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let line = self.fit(line);
        let len = line.len() as u64 + 1;

        let needs_new = match &self.current {
            None => true,
            Some(current) => {
                self.max_file_size > 0
                    && current.size > 0
                    && current.size + len > self.max_file_size
            }
        };
        if needs_new {
            self.start_segment()?;
        }

        let Some(current) = self.current.as_mut() else {
            return Err(SeqLogError::Io(std::io::Error::other("no open segment")));
        };
        current.writer.write_all(line.as_bytes())?;
        current.writer.write_all(b"\n")?;
        current.size += len;
        if let Some(info) = self.segments.back_mut() {
            info.size = current.size;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(current) = self.current.as_mut() {
            current.writer.flush()?;
        }
        Ok(())
    }

    /// Retained segments, oldest first
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.iter().cloned().collect()
    }

    /// Cut `line` so that it and its newline fit in one segment
    fn fit<'a>(&self, line: &'a str) -> &'a str {
        if self.max_file_size == 0 || (line.len() as u64) < self.max_file_size {
            return line;
        }
        let mut end = (self.max_file_size - 1) as usize;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        warn!(
            len = line.len(),
            max_file_size = self.max_file_size,
            "Truncated line longer than a segment"
        );
        &line[..end]
    }

    fn start_segment(&mut self) -> Result<()> {
        if let Some(mut previous) = self.current.take() {
            previous.writer.flush()?;
        }

        let now = Local::now();
        self.opened += 1;
        let name = format!(
            "seqlog-{}-{}.log",
            now.format("%Y%m%d-%H%M%S-%3f"),
            self.opened
        );
        let path = self.dir.join(&name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        info!(segment = %name, "Started log segment");
        self.segments.push_back(SegmentInfo {
            name,
            path,
            size,
            modified: now.with_timezone(&Utc),
        });
        self.current = Some(CurrentSegment {
            writer: BufWriter::new(file),
            size,
        });

        self.enforce_count();
        Ok(())
    }

    fn enforce_count(&mut self) {
        if self.max_file_count == 0 {
            return;
        }
        // The newest entry is the open segment and is never removed
        while self.segments.len() > self.max_file_count.max(1) {
            let Some(oldest) = self.segments.pop_front() else {
                return;
            };
            match fs::remove_file(&oldest.path) {
                Ok(()) => debug!(segment = %oldest.name, "Removed old log segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(segment = %oldest.name, error = %e, "Failed to remove old log segment"),
            }
        }
    }
}

impl Drop for RotationManager {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn existing_segments(dir: &Path) -> Result<Vec<SegmentInfo>> {
    let pattern = dir.join(SEGMENT_PATTERN);
    let pattern = pattern
        .to_str()
        .ok_or_else(|| SeqLogError::config(format!("non UTF-8 path {}", dir.display())))?;
    let entries = glob::glob(pattern)
        .map_err(|e| SeqLogError::config(format!("bad segment pattern: {}", e)))?;

    let mut segments = Vec::new();
    for path in entries.flatten() {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        segments.push(SegmentInfo {
            name,
            path,
            size: meta.len(),
            modified,
        });
    }
    segments.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(segments)
}
