use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use crate::buffer::{self, TraceBuffer};
use crate::config::Config;
use crate::flush;
use crate::gate::{GateState, RoiGate};
use crate::lifecycle;
use crate::record::{MemoryAccessRecord, ThreadId, TraceLine};
use crate::sink::OutputSink;
use crate::TraceError;

/// Events an instrumentation host reports to the collector.
///
/// Every method is called synchronously on the thread that caused the event. An error returned
/// from any of them is fatal: the trace can no longer be trusted to be complete.
pub trait Collector: Send + Sync {
    /// Called before an instrumented instruction executes, once per memory operand.
    fn on_memory_access(&self, record: MemoryAccessRecord) -> Result<(), TraceError>;

    fn on_thread_start(&self, thread: ThreadId) -> Result<(), TraceError>;

    fn on_thread_end(&self, thread: ThreadId, code: i32) -> Result<(), TraceError>;

    /// Called right after the region-of-interest begin marker returns.
    fn on_region_enter(&self, thread: ThreadId) -> Result<(), TraceError>;

    /// Called right after the region-of-interest end marker returns.
    fn on_region_exit(&self, thread: ThreadId) -> Result<(), TraceError>;

    /// Called once when the observed program exits.
    fn on_exit(&self) -> Result<(), TraceError>;
}

/// Collector that buffers memory accesses and writes them to a text trace.
pub struct MemTracer<W: Write> {
    gate: Arc<RoiGate>,
    buffer: TraceBuffer,
    sink: OutputSink<W>,
    roi_only: bool,
}

impl MemTracer<File> {
    /// Opens the trace file and allocates the capture buffer described by `config`.
    pub fn open(config: &Config) -> Result<Self, TraceError> {
        config.validate()?;

        let buffer = TraceBuffer::with_pages(config.buffer_pages, buffer::page_size())?;
        let file = File::create(&config.output).map_err(|source| TraceError::Open {
            path: config.output.clone(),
            source,
        })?;

        tracing::info! {
            output = %config.output.display(),
            records = buffer.capacity(),
            gate = %config.initial_gate,
            "opened memory trace"
        };

        let gate = Arc::new(RoiGate::new(config.initial_gate));
        Ok(Self::new(gate, buffer, OutputSink::new(file)).roi_only(config.roi_only))
    }
}

impl<W: Write + Send> MemTracer<W> {
    pub fn new(gate: Arc<RoiGate>, buffer: TraceBuffer, sink: OutputSink<W>) -> Self {
        Self {
            gate,
            buffer,
            sink,
            roi_only: false,
        }
    }

    /// When set, the first ROI exit ends the trace.
    pub fn roi_only(mut self, roi_only: bool) -> Self {
        self.roi_only = roi_only;
        self
    }

    pub fn gate(&self) -> &Arc<RoiGate> {
        &self.gate
    }

    pub fn buffer(&self) -> &TraceBuffer {
        &self.buffer
    }

    /// Drains everything captured so far to the sink.
    pub fn drain(&self, thread: ThreadId) -> Result<(), TraceError> {
        self.buffer
            .drain(|drain| flush::flush(&self.sink, drain, thread).map(|_| ()))
    }

    /// Drains the buffer, closes the trace and returns the underlying writer.
    ///
    /// Returns `None` if the trace was already closed.
    pub fn finish(&self, thread: ThreadId) -> Result<Option<W>, TraceError> {
        self.drain(thread)?;
        self.sink.finish()
    }
}

impl<W: Write + Send> Collector for MemTracer<W> {
    #[inline]
    fn on_memory_access(&self, record: MemoryAccessRecord) -> Result<(), TraceError> {
        if !self.gate.is_enabled() {
            return Ok(());
        }
        let thread = record.thread();
        self.buffer
            .push(record, |drain| flush::flush(&self.sink, drain, thread).map(|_| ()))
    }

    fn on_thread_start(&self, thread: ThreadId) -> Result<(), TraceError> {
        lifecycle::thread_begin(&self.sink, thread)
    }

    fn on_thread_end(&self, thread: ThreadId, code: i32) -> Result<(), TraceError> {
        lifecycle::thread_end(&self.sink, thread, code)
    }

    fn on_region_enter(&self, thread: ThreadId) -> Result<(), TraceError> {
        let _span = tracing::debug_span!("on_region_enter", thread = %thread).entered();

        if self.sink.is_closed() {
            tracing::warn!("ignoring ROI entry after the trace was closed");
            return Ok(());
        }

        // Records captured before the marker belong before the marker line
        self.drain(thread)?;
        self.sink.append(&TraceLine::RoiEnter(thread))?;

        if self.gate.enter() == GateState::Enabled {
            tracing::debug!("ROI entered while already enabled");
        }
        Ok(())
    }

    fn on_region_exit(&self, thread: ThreadId) -> Result<(), TraceError> {
        let _span = tracing::debug_span!("on_region_exit", thread = %thread).entered();

        if self.gate.exit() == GateState::Disabled {
            tracing::debug!("ROI exited while already disabled");
        }

        self.drain(thread)?;
        self.sink.append(&TraceLine::RoiExit(thread))?;

        if self.roi_only && self.sink.finish()?.is_some() {
            tracing::info!("trace closed at ROI exit");
        }
        Ok(())
    }

    fn on_exit(&self) -> Result<(), TraceError> {
        let _span = tracing::debug_span!("on_exit").entered();
        if self.finish(ThreadId::default())?.is_some() {
            tracing::info!("trace closed at exit");
        }
        Ok(())
    }
}
