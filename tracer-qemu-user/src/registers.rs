use std::cell::RefCell;
use std::sync::OnceLock;

use memtrace::discovery::{ReturnLocation, ReturnSite};
use memtrace::log::Hex;

use crate::{glib, qemu};

/// The register a marker call's return address is found through, if the target exposes it.
static RETURN_REGISTER: OnceLock<Option<RegisterDesc>> = OnceLock::new();

thread_local! {
    static VALUE: RefCell<Option<Register>> = const { RefCell::new(None) };
}

#[derive(Clone)]
pub struct RegisterDesc {
    handle: *mut qemu::qemu_plugin_register,
    name: String,
}

unsafe impl Send for RegisterDesc {}
unsafe impl Sync for RegisterDesc {}

pub struct Register {
    desc: RegisterDesc,
    curr: glib::Owned<*mut glib::GByteArray>,
}

impl Register {
    pub fn read(&mut self) -> Option<&[u8]> {
        let size = unsafe {
            glib::g_byte_array_set_size(*self.curr, 0);
            qemu::qemu_plugin_read_register(self.desc.handle, *self.curr)
        };

        if size < 0 {
            return None;
        }

        let value = self.curr.as_slice()?.get(..size as usize)?;
        tracing::trace! {
            register = self.desc.name.as_str(),
            value = ?value,
            "read register"
        };
        Some(value)
    }
}

impl From<&RegisterDesc> for Register {
    fn from(desc: &RegisterDesc) -> Self {
        Self {
            desc: desc.clone(),
            curr: unsafe { glib::g_byte_array_new() },
        }
    }
}

/// Looks up the register named by `site`. Must run on a vCPU thread.
pub fn initialize(site: &ReturnSite) {
    RETURN_REGISTER.get_or_init(|| {
        let registers = unsafe { qemu::qemu_plugin_get_registers() };

        let Some(registers) = registers.as_slice() else {
            tracing::warn!("register list is null; ROI transitions fire when a marker is left");
            return None;
        };

        let found = site.register_names().iter().find_map(|&wanted| {
            registers
                .iter()
                .find(|desc| desc.name() == Some(wanted))
                .map(|desc| RegisterDesc {
                    handle: desc.handle,
                    name: String::from(wanted),
                })
        });

        match &found {
            Some(desc) => tracing::debug!(register = desc.name.as_str(), "tracking marker returns"),
            None => tracing::warn! {
                wanted = ?site.register_names(),
                "return register not exposed; ROI transitions fire when a marker is left"
            },
        }
        found
    });
}

/// Decodes the return address of the call that just entered a marker routine.
pub fn return_address(site: &ReturnSite) -> Option<u64> {
    let value = VALUE.with_borrow_mut(|register| {
        if register.is_none() {
            *register = RETURN_REGISTER.get()?.as_ref().map(Register::from);
        }
        site.decode(register.as_mut()?.read()?)
    })?;

    match site.location {
        ReturnLocation::Register(_) => Some(value),
        ReturnLocation::StackTop(_) => {
            // user-mode guest memory is mapped into the host address space
            let ptr = value as *const u8;
            let slot = unsafe { std::slice::from_raw_parts(ptr, site.width) };
            let address = site.decode(slot)?;
            tracing::trace!(stack = %Hex(value), address = %Hex(address), "read return address");
            Some(address)
        }
    }
}
