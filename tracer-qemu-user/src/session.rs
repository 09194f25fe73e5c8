use std::collections::HashMap;
use std::fs::File;
use std::sync::OnceLock;

use memtrace::discovery::{Discovered, Marker, MarkerSink, ReturnSite, Routine};
use memtrace::instrument::RecordMode;
use memtrace::{MemTracer, TraceError};

static SESSION: OnceLock<Session> = OnceLock::new();

/// Everything the plugin callbacks share for the lifetime of the emulated process.
pub struct Session {
    pub tracer: MemTracer<File>,
    pub record_mode: RecordMode,
    /// Marker routines, used to tell whether a block still belongs to one.
    pub markers: Discovered,
    /// Entry points of the marker routines.
    pub entries: HashMap<u64, Marker>,
    /// How the target passes return addresses, used to find where a marker call returns.
    pub return_site: Option<ReturnSite>,
}

/// Marker entry points collected during discovery, hooked later at translation time.
#[derive(Debug, Default)]
pub struct MarkerEntries(pub HashMap<u64, Marker>);

impl MarkerSink for MarkerEntries {
    fn call_after(&mut self, routine: Routine, marker: Marker) {
        self.0.insert(routine.address, marker);
    }
}

pub(crate) fn initialize(session: Session) {
    if SESSION.set(session).is_err() {
        tracing::error!("memory trace session initialized twice");
        panic!()
    }
}

/// Runs `f` against the session; a failure is fatal.
pub(crate) fn with<F, R>(f: F) -> R
where
    F: FnOnce(&Session) -> Result<R, TraceError>,
{
    let Some(session) = SESSION.get() else {
        tracing::error!("attempted to use the memory trace before initialization");
        panic!()
    };

    match f(session) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "memory trace failed");
            panic!()
        }
    }
}
