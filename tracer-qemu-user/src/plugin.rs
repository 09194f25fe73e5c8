use std::cell::Cell;
use std::path::PathBuf;

use memtrace::discovery::{self, ElfImage, Marker, PendingMarker, ReturnSite, SymbolSource};
use memtrace::instrument::{self, InstructionInfo, Probe};
use memtrace::log::Hex;
use memtrace::{Access, Collector, Config, MemTracer, MemoryAccessRecord, ThreadId, TraceError};

use crate::session::{self, MarkerEntries, Session};
use crate::{qemu, registers};

pub fn on_plugin_install(
    id: qemu::qemu_plugin_id_t,
    info: &qemu::qemu_info_t,
    args: Args,
) -> Result<(), TraceError> {
    let _span = tracing::trace_span!("on_plugin_install", id = id).entered();

    if info.system_emulation {
        tracing::warn!("memory trace expects user-mode emulation; thread ids will be vCPU indices");
    }
    tracing::debug!(arch = ?info.target_name(), "installing memory trace plugin");

    let config = Config::from_args(args)?;
    let tracer = MemTracer::open(&config)?;

    let mut entries = MarkerEntries::default();
    let markers = match image_path(&config) {
        Some(path) => match ElfImage::open(&path) {
            Ok(mut image) => {
                relocate(&mut image, config.image_bias);
                discovery::discover(&image, &config.markers, &mut entries)
            }
            Err(err) => {
                tracing::warn!(image = %path.display(), error = %err, "skipping ROI marker discovery");
                Default::default()
            }
        },
        None => {
            tracing::warn!("no guest image to search for ROI markers");
            Default::default()
        }
    };

    let return_site = info.target_name().and_then(ReturnSite::for_target);
    if return_site.is_none() && !markers.is_empty() {
        tracing::warn! {
            arch = ?info.target_name(),
            "unknown calling convention; ROI transitions fire when a marker is left"
        };
    }

    session::initialize(Session {
        tracer,
        record_mode: config.record_mode,
        markers,
        entries: entries.0,
        return_site,
    });

    register_vcpu_init::<Plugin>(id);
    register_vcpu_exit::<Plugin>(id);
    register_on_tb_trans::<Plugin>(id);
    register_on_exit(Plugin, id);

    Ok(())
}

/// Moves the image's symbols to where the guest loaded it.
fn relocate(image: &mut ElfImage, bias: Option<u64>) {
    match bias {
        Some(bias) => image.set_bias(bias),
        None if image.is_position_independent() => {
            let loaded_entry = unsafe { qemu::qemu_plugin_entry_code() };
            image.relocate_to_entry(loaded_entry);
        }
        None => {}
    }

    if image.is_unrelocated() {
        tracing::warn! {
            image = image.name(),
            "position-independent image has no load bias; markers will not match, set image_bias"
        };
    } else {
        tracing::debug!(image = image.name(), bias = %Hex(image.bias()), "relocated image");
    }
}

fn image_path(config: &Config) -> Option<PathBuf> {
    if let Some(image) = &config.image {
        return Some(image.clone());
    }

    let path = unsafe { qemu::qemu_plugin_path_to_binary() };
    path.to_str().map(PathBuf::from)
}

pub struct Scope;

pub struct Args<'scope> {
    _scope: &'scope Scope,
    argc: usize,
    argv: *const *const std::os::raw::c_char,
    curr: usize,
}

impl<'scope> Args<'scope> {
    pub fn new(s: &'scope Scope, argc: i32, argv: *const *const std::os::raw::c_char) -> Self {
        if argc < 0 {
            tracing::error!(argc = argc, "unexpected value for argc");
            panic!()
        }

        if argc > 0 && argv.is_null() {
            tracing::error!(argv = ?argv, "unexpected value for argv");
            panic!()
        }

        Self {
            _scope: s,
            argc: argc as usize,
            argv,
            curr: 0,
        }
    }
}

impl<'scope> Iterator for Args<'scope> {
    type Item = &'scope str;

    fn next(&mut self) -> Option<Self::Item> {
        while self.curr < self.argc {
            let i = self.curr;
            self.curr += 1;

            let argv_n = unsafe { self.argv.add(i).read() };
            if argv_n.is_null() {
                tracing::warn!(n = i, "skipping null argument");
                continue;
            }

            let c_str = unsafe { std::ffi::CStr::from_ptr(argv_n) };

            let Ok(arg) = c_str.to_str() else {
                tracing::warn!(n = i, arg = ?c_str, "skipping argument with non-UTF-8 data");
                continue;
            };

            return Some(arg);
        }
        None
    }
}

pub struct Plugin;

pub trait OnVCpuInit {
    fn on_vcpu_init(id: qemu::qemu_plugin_id_t, vcpu_index: u32);
}

impl OnVCpuInit for Plugin {
    fn on_vcpu_init(id: qemu::qemu_plugin_id_t, vcpu_index: u32) {
        let _span = tracing::trace_span!("on_vcpu_init", id = id, vcpu = vcpu_index).entered();
        session::with(|s| {
            if let Some(site) = &s.return_site {
                if !s.markers.is_empty() {
                    registers::initialize(site);
                }
            }
            s.tracer.on_thread_start(ThreadId::new(vcpu_index))
        });
    }
}

pub trait OnVCpuExit {
    fn on_vcpu_exit(id: qemu::qemu_plugin_id_t, vcpu_index: u32);
}

impl OnVCpuExit for Plugin {
    fn on_vcpu_exit(id: qemu::qemu_plugin_id_t, vcpu_index: u32) {
        let _span = tracing::trace_span!("on_vcpu_exit", id = id, vcpu = vcpu_index).entered();
        // the guest's exit status is not visible to plugins
        session::with(|s| s.tracer.on_thread_end(ThreadId::new(vcpu_index), 0));
    }
}

pub trait OnExit {
    fn on_exit(&self, id: qemu::qemu_plugin_id_t);
}

impl OnExit for Plugin {
    fn on_exit(&self, id: qemu::qemu_plugin_id_t) {
        let _span = tracing::trace_span!("on_exit", id = id).entered();
        session::with(|s| s.tracer.on_exit());
    }
}

pub trait OnTbTrans {
    fn on_tb_trans(id: qemu::qemu_plugin_id_t, tb: *mut qemu::qemu_plugin_tb);
}

impl OnTbTrans for Plugin {
    fn on_tb_trans(id: qemu::qemu_plugin_id_t, tb: *mut qemu::qemu_plugin_tb) {
        let start = unsafe { qemu::qemu_plugin_tb_vaddr(tb) };
        let _span = tracing::trace_span! {
            "on_tb_trans",
            id = id,
            address = %Hex(start)
        }
        .entered();

        session::with(|s| {
            if !s.markers.is_empty() {
                register_on_tb_exec(BlockStart { address: start }, tb);
            }

            let count = unsafe { qemu::qemu_plugin_tb_n_insns(tb) };
            for i in 0..count {
                let insn = unsafe { qemu::qemu_plugin_tb_get_insn(tb, i) };
                let pc = unsafe { qemu::qemu_plugin_insn_vaddr(insn) };

                if let Some(&marker) = s.entries.get(&pc) {
                    tracing::debug!(address = %Hex(pc), marker = ?marker, "hooking ROI marker");
                    let call = MarkerCall { marker };
                    register_on_insn_exec(call, insn, qemu::QEMU_PLUGIN_CB_R_REGS);
                }

                // operand sizes are only known once the access happens, so the planner sees
                // no memory operands here and only contributes the bare record
                let info = InstructionInfo {
                    pc,
                    ..Default::default()
                };
                for probe in instrument::plan(&info, s.record_mode) {
                    register_on_insn_exec(probe, insn, qemu::QEMU_PLUGIN_CB_NO_REGS);
                }

                register_on_mem(Instruction { pc }, insn);
            }

            Ok(())
        });
    }
}

thread_local! {
    /// Marker routine the current vCPU has called and that has not yet returned.
    static PENDING_MARKER: Cell<Option<PendingMarker>> = const { Cell::new(None) };
}

/// Executed when a marker routine is called.
struct MarkerCall {
    marker: Marker,
}

pub trait OnInsnExec {
    fn on_insn_exec(&self, vcpu_index: u32);
}

impl OnInsnExec for MarkerCall {
    fn on_insn_exec(&self, vcpu_index: u32) {
        let _span = tracing::trace_span!("on_marker_call", vcpu = vcpu_index).entered();
        let return_address =
            session::with(|s| Ok(s.return_site.as_ref().and_then(registers::return_address)));
        if let Some(address) = return_address {
            tracing::trace!(marker = ?self.marker, returns_to = %Hex(address));
        }
        PENDING_MARKER.set(Some(PendingMarker {
            marker: self.marker,
            return_address,
        }));
    }
}

impl OnInsnExec for Probe {
    fn on_insn_exec(&self, vcpu_index: u32) {
        let record = self.record(0, ThreadId::new(vcpu_index));
        session::with(|s| s.tracer.on_memory_access(record));
    }
}

/// Start of a translated block; completes a pending marker once its call has returned.
struct BlockStart {
    address: u64,
}

pub trait OnTbExec {
    fn on_tb_exec(&self, vcpu_index: u32);
}

impl OnTbExec for BlockStart {
    fn on_tb_exec(&self, vcpu_index: u32) {
        let Some(pending) = PENDING_MARKER.get() else {
            return;
        };

        let _span = tracing::trace_span! {
            "on_tb_exec",
            vcpu = vcpu_index,
            address = %Hex(self.address),
        }
        .entered();

        session::with(|s| {
            if !pending.returns_at(self.address, &s.markers) {
                return Ok(());
            }

            PENDING_MARKER.set(None);
            let thread = ThreadId::new(vcpu_index);
            match pending.marker {
                Marker::Enter => s.tracer.on_region_enter(thread),
                Marker::Exit => s.tracer.on_region_exit(thread),
            }
        });
    }
}

struct Instruction {
    pc: u64,
}

pub trait OnMem {
    fn on_mem(&self, vcpu_index: u32, info: qemu::qemu_plugin_meminfo_t, vaddr: u64);
}

impl OnMem for Instruction {
    fn on_mem(&self, vcpu_index: u32, info: qemu::qemu_plugin_meminfo_t, vaddr: u64) {
        let size_shift = unsafe { qemu::qemu_plugin_mem_size_shift(info) };
        let is_store = unsafe { qemu::qemu_plugin_mem_is_store(info) };
        let access = if is_store { Access::Write } else { Access::Read };

        tracing::trace! {
            vcpu = vcpu_index,
            pc = %Hex(self.pc),
            address = %Hex(vaddr),
            size = 1u32 << size_shift,
            access = ?access,
        };

        let record = MemoryAccessRecord::new(
            self.pc,
            vaddr,
            1 << size_shift,
            ThreadId::new(vcpu_index),
            access,
        );
        session::with(|s| s.tracer.on_memory_access(record));
    }
}

pub fn register_vcpu_init<T: OnVCpuInit>(id: qemu::qemu_plugin_id_t) {
    unsafe {
        qemu::qemu_plugin_register_vcpu_init_cb(id, qemu::vcpu_init_wrapper::<T>);
    }
}

pub fn register_vcpu_exit<T: OnVCpuExit>(id: qemu::qemu_plugin_id_t) {
    unsafe {
        qemu::qemu_plugin_register_vcpu_exit_cb(id, qemu::vcpu_exit_wrapper::<T>);
    }
}

pub fn register_on_exit<T: OnExit>(t: T, id: qemu::qemu_plugin_id_t) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_atexit_cb(id, qemu::atexit_wrapper::<T>, userdata.cast());
    }
}

pub fn register_on_tb_trans<T: OnTbTrans>(id: qemu::qemu_plugin_id_t) {
    unsafe {
        qemu::qemu_plugin_register_vcpu_tb_trans_cb(id, qemu::vcpu_tb_trans_wrapper::<T>);
    }
}

pub fn register_on_tb_exec<T: OnTbExec>(t: T, tb: *mut qemu::qemu_plugin_tb) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_vcpu_tb_exec_cb(
            tb,
            qemu::vcpu_tb_exec_wrapper::<T>,
            qemu::QEMU_PLUGIN_CB_NO_REGS,
            userdata as _,
        );
    }
}

pub fn register_on_insn_exec<T: OnInsnExec>(t: T, insn: *mut qemu::qemu_plugin_insn, flags: i32) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_vcpu_insn_exec_cb(
            insn,
            qemu::vcpu_insn_exec_wrapper::<T>,
            flags,
            userdata as _,
        );
    }
}

pub fn register_on_mem<T: OnMem>(t: T, insn: *mut qemu::qemu_plugin_insn) {
    let userdata: *mut T = Box::leak(Box::new(t)) as _;
    unsafe {
        qemu::qemu_plugin_register_vcpu_mem_cb(
            insn,
            qemu::vcpu_mem_wrapper::<T>,
            qemu::QEMU_PLUGIN_CB_NO_REGS,
            qemu::QEMU_PLUGIN_MEM_RW,
            userdata as _,
        );
    }
}
