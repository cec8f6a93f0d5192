//! Console mirror of the durable log

use std::io::{self, Stdout, Write};

use super::TraceSink;
use crate::error::Result;
use crate::event::FlushedEvent;
use crate::record::Level;

/// Writes formatted lines to a terminal, coloured by level
pub struct ScreenSink<W: Write + Send + 'static = Stdout> {
    out: W,
    colored: bool,
}

impl ScreenSink<Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: io::stdout(),
            colored: true,
        }
    }
}

impl<W: Write + Send + 'static> ScreenSink<W> {
    pub fn new(out: W, colored: bool) -> Self {
        Self { out, colored }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn color_code(level: Level) -> &'static str {
    match level {
        Level::Debug => "32",
        Level::Info => "37;1",
        Level::Warn => "33;1",
        Level::Error => "31;1",
    }
}

impl<W: Write + Send + 'static> TraceSink for ScreenSink<W> {
    fn name(&self) -> &str {
        "screen"
    }

    fn write(&mut self, events: &[FlushedEvent]) -> Result<()> {
        for event in events {
            let line = event.format_line();
            if self.colored {
                writeln!(self.out, "\x1b[{}m{}\x1b[0m", color_code(event.level()), line)?;
            } else {
                writeln!(self.out, "{}", line)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OutputFlag, Record, Tag};

    fn error_event() -> FlushedEvent {
        FlushedEvent::new(
            Record::message(Tag::new(2, 1), 1, Level::Error, OutputFlag::OutputAll, "card declined"),
            1,
            None,
        )
    }

    #[test]
    fn test_error_lines_are_red() {
        let mut sink = ScreenSink::new(Vec::new(), true);
        sink.write(&[error_event()]).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.starts_with("\x1b[31;1m"));
        assert!(text.ends_with("card declined\x1b[0m\n"));
    }

    #[test]
    fn test_plain_output() {
        let mut sink = ScreenSink::new(Vec::new(), false);
        sink.write(&[error_event()]).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(!text.contains('\x1b'));
        assert!(text.ends_with("card declined\n"));
    }
}
