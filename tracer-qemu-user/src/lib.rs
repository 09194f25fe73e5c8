//! QEMU user-mode TCG plugin that records a memory access trace of the emulated program.
//!
//! Plugin arguments are `key=value` pairs handled by [`memtrace::Config::from_args`].

mod glib;
mod log;
mod plugin;
mod qemu;
mod registers;
mod session;
