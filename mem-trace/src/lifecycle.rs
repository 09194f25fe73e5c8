use std::io::Write;

use crate::record::{ThreadId, TraceLine};
use crate::sink::OutputSink;
use crate::TraceError;

/// Appends `thread begin <id>`.
pub fn thread_begin<W: Write>(sink: &OutputSink<W>, thread: ThreadId) -> Result<(), TraceError> {
    let _span = tracing::trace_span!("thread_begin", thread = %thread).entered();
    sink.append(&TraceLine::ThreadBegin(thread))
}

/// Appends `thread end <id> code <code>`.
pub fn thread_end<W: Write>(
    sink: &OutputSink<W>,
    thread: ThreadId,
    code: i32,
) -> Result<(), TraceError> {
    let _span = tracing::trace_span!("thread_end", thread = %thread, code = code).entered();
    sink.append(&TraceLine::ThreadEnd { thread, code })
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_begin_end_lines() {
        let sink = OutputSink::new(Vec::new());
        thread_begin(&sink, ThreadId::new(0)).unwrap();
        thread_begin(&sink, ThreadId::new(1)).unwrap();
        thread_end(&sink, ThreadId::new(1), 0).unwrap();
        // ids are reusable once a thread has ended
        thread_begin(&sink, ThreadId::new(1)).unwrap();
        thread_end(&sink, ThreadId::new(0), 3).unwrap();

        let output = String::from_utf8(sink.finish().unwrap().unwrap()).unwrap();
        assert_eq!(
            output,
            "thread begin 0\n\
             thread begin 1\n\
             thread end 1 code 0\n\
             thread begin 1\n\
             thread end 0 code 3\n\
             #eof\n"
        );
    }
}
