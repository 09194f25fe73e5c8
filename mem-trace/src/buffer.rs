//! Fixed-capacity arena that instrumented threads fill concurrently.
//!
//! Writers claim a slot by bumping a shared cursor, store their record and then bump the commit
//! counter. The writer that claims the final slot waits for every other claimant to commit, hands
//! the full arena to the drain callback, and resets both counters. Writers that claim past the end
//! back off until that reset happens and then claim again, so a full arena is never written while
//! it is being drained.
//!
//! ```plaintext
//!            cursor (next claim)
//!                 v
//! +---+---+---+---+---+---+
//! | W | W | W | . | . | . |   W = written, . = unwritten
//! +---+---+---+---+---+---+
//! ```
//!
//! Every slot below the commit count has been written, so slots carry no state of their own.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

use crate::record::MemoryAccessRecord;
use crate::TraceError;

/// Returns the size of an OS page in bytes.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        tracing::warn!(size = size, "sysconf returned an invalid page size, assuming 4096");
        return 4096;
    }
    size as usize
}

#[repr(transparent)]
struct Slot(UnsafeCell<MemoryAccessRecord>);

impl Slot {
    fn new() -> Self {
        Self(UnsafeCell::new(MemoryAccessRecord::default()))
    }
}

pub struct TraceBuffer {
    slots: Box<[Slot]>,
    cursor: CachePadded<AtomicUsize>,
    committed: CachePadded<AtomicUsize>,
}

// SAFETY: Every slot is written by exactly one claimant per generation (the cursor hands out each
// index once between resets) and is only read by the drain after all claimants have committed.
unsafe impl Sync for TraceBuffer {}
unsafe impl Send for TraceBuffer {}

impl TraceBuffer {
    /// Allocates a buffer holding `capacity` records.
    pub fn new(capacity: usize) -> Result<Self, TraceError> {
        if capacity == 0 {
            return Err(TraceError::Config(String::from(
                "trace buffer must hold at least one record",
            )));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| TraceError::Allocation { records: capacity })?;
        slots.extend((0..capacity).map(|_| Slot::new()));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            committed: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Allocates a buffer spanning `pages` pages of `page_size` bytes.
    pub fn with_pages(pages: usize, page_size: usize) -> Result<Self, TraceError> {
        let bytes = pages.checked_mul(page_size).ok_or_else(|| {
            TraceError::Config(format!("{pages} pages of {page_size} bytes overflows"))
        })?;
        Self::new(bytes / mem::size_of::<Slot>())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of records committed to the current generation.
    pub fn len(&self) -> usize {
        self.committed.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `record` in the next free slot.
    ///
    /// If this store fills the buffer, `on_full` is called with the full contents before this
    /// method returns, and the buffer is empty again afterwards regardless of its result.
    pub fn push<F, E>(&self, record: MemoryAccessRecord, on_full: F) -> Result<(), E>
    where
        F: FnOnce(Drain<'_>) -> Result<(), E>,
    {
        let capacity = self.capacity();
        let index = self.claim();
        let slot = &self.slots[index];

        // SAFETY: `index` was handed out to this caller only.
        unsafe {
            *slot.0.get() = record;
        }
        self.committed.fetch_add(1, Ordering::AcqRel);

        if index + 1 < capacity {
            return Ok(());
        }

        let backoff = Backoff::new();
        while self.committed.load(Ordering::Acquire) < capacity {
            backoff.snooze();
        }

        tracing::trace!(records = capacity, "trace buffer is full");
        let result = on_full(Drain::new(&self.slots));
        self.reset();
        result
    }

    /// Drains whatever has been committed so far, full or not.
    ///
    /// Concurrent writers back off until the drain completes. If a buffer-full drain is already
    /// running, this waits for it to finish first.
    pub fn drain<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(Drain<'_>) -> Result<(), E>,
    {
        let capacity = self.capacity();
        let backoff = Backoff::new();

        let claimed = loop {
            let current = self.cursor.load(Ordering::Acquire);
            if current >= capacity {
                backoff.snooze();
                continue;
            }
            if self
                .cursor
                .compare_exchange_weak(current, capacity, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break current;
            }
        };

        backoff.reset();
        while self.committed.load(Ordering::Acquire) < claimed {
            backoff.snooze();
        }

        let result = f(Drain::new(&self.slots[..claimed]));
        self.reset();
        result
    }

    fn claim(&self) -> usize {
        let capacity = self.capacity();
        let backoff = Backoff::new();
        loop {
            let index = self.cursor.fetch_add(1, Ordering::AcqRel);
            if index < capacity {
                return index;
            }
            while self.cursor.load(Ordering::Acquire) >= capacity {
                backoff.snooze();
            }
        }
    }

    fn reset(&self) {
        self.committed.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Release);
    }
}

/// Exclusive view of the committed slots of a [`TraceBuffer`] while it is being drained.
pub struct Drain<'b> {
    slots: &'b [Slot],
}

impl<'b> Drain<'b> {
    fn new(slots: &'b [Slot]) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the records in slot order.
    pub fn records(&self) -> impl Iterator<Item = MemoryAccessRecord> + 'b {
        self.slots.iter().map(|slot| {
            // SAFETY: Every slot in the view was claimed and committed, and no new claims are
            // handed out until the drain returns.
            unsafe { *slot.0.get() }
        })
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::record::ThreadId;

    fn record(i: u64, tid: u32) -> MemoryAccessRecord {
        MemoryAccessRecord::read(i, 0x1000 + i, 4, ThreadId::new(tid))
    }

    #[test]
    fn test_drain_on_full() {
        let buffer = TraceBuffer::new(4).unwrap();
        let mut drained = Vec::new();

        for i in 0..3 {
            buffer
                .push(record(i, 0), |_| -> Result<(), ()> { panic!("drained early") })
                .unwrap();
        }
        assert_eq!(buffer.len(), 3);

        buffer
            .push(record(3, 0), |drain| -> Result<(), ()> {
                assert_eq!(drain.len(), 4);
                drained.extend(drain.records().map(|r| r.pc()));
                Ok(())
            })
            .unwrap();

        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reset_after_failed_drain() {
        let buffer = TraceBuffer::new(1).unwrap();
        let result = buffer.push(record(0, 0), |_| Err("disk full"));
        assert_eq!(result, Err("disk full"));
        assert!(buffer.is_empty());

        let mut seen = 0;
        buffer
            .push(record(1, 0), |drain| -> Result<(), ()> {
                seen = drain.records().count();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_partial_drain() {
        let buffer = TraceBuffer::new(8).unwrap();
        for i in 0..5 {
            buffer.push(record(i, 1), |_| -> Result<(), ()> { Ok(()) }).unwrap();
        }

        let mut drained = Vec::new();
        buffer
            .drain(|drain| -> Result<(), ()> {
                drained.extend(drain.records().map(|r| r.pc()));
                Ok(())
            })
            .unwrap();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());

        buffer
            .drain(|drain| -> Result<(), ()> {
                assert!(drain.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_with_pages() {
        let buffer = TraceBuffer::with_pages(2, 4096).unwrap();
        assert_eq!(
            buffer.capacity(),
            8192 / mem::size_of::<MemoryAccessRecord>()
        );
        // the arena costs no more than the records it holds
        assert_eq!(
            mem::size_of_val(&*buffer.slots),
            buffer.capacity() * mem::size_of::<MemoryAccessRecord>()
        );
        assert!(matches!(
            TraceBuffer::with_pages(0, 4096),
            Err(TraceError::Config(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        const THREADS: u32 = 8;
        const PER_THREAD: u64 = 10_000;

        let buffer = Arc::new(TraceBuffer::new(97).unwrap());
        let sink = Arc::new(std::sync::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let buffer = Arc::clone(&buffer);
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        buffer
                            .push(record(i, tid), |drain| -> Result<(), ()> {
                                sink.lock().unwrap().extend(drain.records());
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sink_for_drain = Arc::clone(&sink);
        buffer
            .drain(|drain| -> Result<(), ()> {
                sink_for_drain.lock().unwrap().extend(drain.records());
                Ok(())
            })
            .unwrap();

        let records = sink.lock().unwrap();
        assert_eq!(records.len(), (THREADS as u64 * PER_THREAD) as usize);

        // per-thread program order survives the interleaving
        for tid in 0..THREADS {
            let pcs: Vec<u64> = records
                .iter()
                .filter(|r| r.thread() == ThreadId::new(tid))
                .map(|r| r.pc())
                .collect();
            assert_eq!(pcs, (0..PER_THREAD).collect::<Vec<_>>());
        }
    }
}
