use std::fmt::Display;
use std::io::{BufWriter, Write};
use std::sync::{Mutex, MutexGuard};

use crate::record::TraceLine;
use crate::TraceError;

/// The single text stream every trace line is appended to.
///
/// Appenders take the sink lock for the duration of a logical write (one line, or one drained
/// buffer), so lines from different threads never interleave. Once [`OutputSink::finish`] has run
/// the sink is closed and later appends are dropped.
pub struct OutputSink<W: Write> {
    state: Mutex<Option<BufWriter<W>>>,
}

impl<W: Write> OutputSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(Some(BufWriter::new(writer))),
        }
    }

    /// Acquires exclusive access to the sink.
    pub fn lock(&self) -> Result<SinkGuard<'_, W>, TraceError> {
        let Ok(guard) = self.state.lock() else {
            tracing::error!("output sink lock is poisoned");
            return Err(TraceError::Poisoned);
        };
        Ok(SinkGuard { guard })
    }

    /// Appends one line and flushes it.
    pub fn append(&self, line: &TraceLine) -> Result<(), TraceError> {
        let mut sink = self.lock()?;
        sink.write_line(line)?;
        sink.flush()
    }

    /// Appends the end-of-trace marker, flushes and closes the sink.
    ///
    /// Returns the underlying writer the first time it is called and `None` afterwards.
    pub fn finish(&self) -> Result<Option<W>, TraceError> {
        self.lock()?.finish()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map_or(true, |state| state.is_none())
    }
}

pub struct SinkGuard<'s, W: Write> {
    guard: MutexGuard<'s, Option<BufWriter<W>>>,
}

impl<W: Write> SinkGuard<'_, W> {
    pub fn write_line<T: Display>(&mut self, line: T) -> Result<(), TraceError> {
        let Some(writer) = self.guard.as_mut() else {
            tracing::debug!(line = %line, "dropping line appended after the trace was closed");
            return Ok(());
        };
        writeln!(writer, "{line}").map_err(TraceError::Write)
    }

    pub fn flush(&mut self) -> Result<(), TraceError> {
        match self.guard.as_mut() {
            Some(writer) => writer.flush().map_err(TraceError::Write),
            None => Ok(()),
        }
    }

    /// See [`OutputSink::finish`].
    pub fn finish(&mut self) -> Result<Option<W>, TraceError> {
        if self.guard.is_none() {
            return Ok(None);
        }
        self.write_line(TraceLine::Eof)?;
        let Some(writer) = self.guard.take() else {
            return Ok(None);
        };
        let writer = writer
            .into_inner()
            .map_err(|err| TraceError::Write(err.into_error()))?;
        Ok(Some(writer))
    }
}

#[cfg(test)]
mod tests {

    use std::io;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::record::ThreadId;

    #[test]
    fn test_finish_closes_once() {
        let sink = OutputSink::new(Vec::new());
        sink.append(&TraceLine::ThreadBegin(ThreadId::new(0))).unwrap();

        let output = sink.finish().unwrap().unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "thread begin 0\n#eof\n");
        assert!(sink.is_closed());

        assert!(sink.finish().unwrap().is_none());
        sink.append(&TraceLine::ThreadBegin(ThreadId::new(1))).unwrap();
    }

    #[test]
    fn test_lines_do_not_interleave() {
        let sink = Arc::new(OutputSink::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|tid| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for _ in 0..500 {
                        sink.append(&TraceLine::RoiEnter(ThreadId::new(tid))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let output = String::from_utf8(sink.finish().unwrap().unwrap()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2001);
        assert!(lines[..2000]
            .iter()
            .all(|line| line.parse::<TraceLine>().is_ok()));
        assert_eq!(lines[2000], "#eof");
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_is_reported() {
        let sink = OutputSink::new(BrokenPipe);
        let result = sink.append(&TraceLine::ThreadBegin(ThreadId::new(0)));
        assert!(matches!(result, Err(TraceError::Write(_))));
    }
}
