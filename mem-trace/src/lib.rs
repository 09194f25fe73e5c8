use std::io;
use std::path::PathBuf;

pub mod buffer;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod flush;
pub mod gate;
pub mod instrument;
pub mod lifecycle;
pub mod log;
pub mod record;
pub mod sink;

pub use collector::{Collector, MemTracer};
pub use config::Config;
pub use gate::{GateState, RoiGate};
pub use record::{Access, MemoryAccessRecord, ThreadId, TraceLine};

#[derive(thiserror::Error, Debug)]
pub enum TraceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unable to allocate a trace buffer of {records} records")]
    Allocation { records: usize },

    #[error("unable to open trace output {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to trace output")]
    Write(#[source] io::Error),

    #[error("trace output lock is poisoned")]
    Poisoned,

    #[error("unable to read image {path:?}")]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to read symbol table")]
    Symbols(#[from] object::Error),
}
