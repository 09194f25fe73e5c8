use std::io::Write;

use crate::buffer::Drain;
use crate::record::{MemoryAccessRecord, ThreadId};
use crate::sink::{OutputSink, SinkGuard};
use crate::TraceError;

/// Counts reported by a single flush.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Records written to the sink.
    pub written: usize,
    /// Sentinel records that were dropped.
    pub skipped: usize,
}

/// Writes every drained record to the sink while holding the sink lock.
///
/// `trigger` is the thread whose store filled the buffer (or that requested the drain). The sink
/// is flushed before the lock is released, and any write error is returned to the caller
/// unchanged: the buffer contents are gone once this returns.
pub fn flush<W: Write>(
    sink: &OutputSink<W>,
    drain: Drain<'_>,
    trigger: ThreadId,
) -> Result<FlushStats, TraceError> {
    let _span = tracing::debug_span!("flush", thread = %trigger, slots = drain.len()).entered();

    let mut guard = sink.lock()?;
    let stats = write_records(&mut guard, drain.records())?;
    guard.flush()?;
    drop(guard);

    tracing::debug!(
        written = stats.written,
        skipped = stats.skipped,
        "flushed trace buffer"
    );
    Ok(stats)
}

fn write_records<W, I>(sink: &mut SinkGuard<'_, W>, records: I) -> Result<FlushStats, TraceError>
where
    W: Write,
    I: IntoIterator<Item = MemoryAccessRecord>,
{
    let mut stats = FlushStats::default();
    for record in records {
        if record.is_sentinel() {
            stats.skipped += 1;
            continue;
        }
        sink.write_line(record)?;
        stats.written += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::buffer::TraceBuffer;
    use crate::record::TraceLine;

    #[test]
    fn test_sentinels_are_omitted() {
        let tid = ThreadId::new(4);
        let sink = OutputSink::new(Vec::new());
        let buffer = TraceBuffer::new(4).unwrap();

        let records = [
            MemoryAccessRecord::read(0x10, 0x100, 8, tid),
            MemoryAccessRecord::bare(0x14, tid),
            MemoryAccessRecord::write(0x18, 0x200, 4, tid),
            MemoryAccessRecord::bare(0x1c, tid),
        ];

        let mut stats = None;
        for record in records {
            buffer
                .push(record, |drain| {
                    stats = Some(flush(&sink, drain, tid)?);
                    Ok::<_, TraceError>(())
                })
                .unwrap();
        }

        assert_eq!(
            stats,
            Some(FlushStats {
                written: 2,
                skipped: 2
            })
        );

        let output = String::from_utf8(sink.finish().unwrap().unwrap()).unwrap();
        let lines: Vec<TraceLine> = output.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(
            lines,
            vec![
                TraceLine::Access(records[0]),
                TraceLine::Access(records[2]),
                TraceLine::Eof
            ]
        );
    }
}
