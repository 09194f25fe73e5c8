//! Locates the region-of-interest marker routines in loaded modules.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};

use crate::TraceError;

pub const ROI_BEGIN: &str = "__parsec_roi_begin";
pub const ROI_END: &str = "__parsec_roi_end";

/// Names of the routines that bracket the region of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerNames {
    pub begin: String,
    pub end: String,
}

impl Default for MarkerNames {
    fn default() -> Self {
        Self {
            begin: String::from(ROI_BEGIN),
            end: String::from(ROI_END),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Marker {
    Enter,
    Exit,
}

/// Address range of a routine in the observed program.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Routine {
    pub address: u64,
    pub size: u64,
}

impl Routine {
    pub fn contains(&self, address: u64) -> bool {
        // zero-sized symbols still own their entry point
        address == self.address
            || (address > self.address && address - self.address < self.size)
    }
}

/// A loaded module whose routines can be looked up by name.
pub trait SymbolSource {
    fn name(&self) -> &str;

    fn find_routine(&self, name: &str) -> Option<Routine>;
}

/// Receives requests to run a marker transition right after a routine returns.
pub trait MarkerSink {
    fn call_after(&mut self, routine: Routine, marker: Marker);
}

/// Marker routines found in one module.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    pub enter: Option<Routine>,
    pub exit: Option<Routine>,
}

impl Discovered {
    pub fn is_empty(&self) -> bool {
        self.enter.is_none() && self.exit.is_none()
    }

    pub fn marker_at(&self, address: u64) -> Option<Marker> {
        if self.enter.is_some_and(|r| r.contains(address)) {
            return Some(Marker::Enter);
        }
        if self.exit.is_some_and(|r| r.contains(address)) {
            return Some(Marker::Exit);
        }
        None
    }
}

/// Where a routine that was just called finds the address it returns to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReturnLocation {
    /// A link register, under any of these names.
    Register(&'static [&'static str]),
    /// The top of the stack; the stack pointer goes by any of these names.
    StackTop(&'static [&'static str]),
}

/// Calling convention details needed to find a call's return address at routine entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReturnSite {
    pub location: ReturnLocation,
    /// Width of a code address in bytes.
    pub width: usize,
    pub big_endian: bool,
}

impl ReturnSite {
    /// Returns the convention for a target architecture name such as `x86_64` or `aarch64`.
    pub fn for_target(target: &str) -> Option<Self> {
        use ReturnLocation::{Register, StackTop};

        let (location, width, big_endian) = match target {
            "x86_64" => (StackTop(&["rsp"]), 8, false),
            "i386" => (StackTop(&["esp"]), 4, false),
            "aarch64" => (Register(&["lr", "x30"]), 8, false),
            "arm" => (Register(&["lr", "r14"]), 4, false),
            "riscv64" => (Register(&["ra", "x1"]), 8, false),
            "riscv32" => (Register(&["ra", "x1"]), 4, false),
            "ppc64" => (Register(&["lr"]), 8, true),
            "ppc" => (Register(&["lr"]), 4, true),
            "mips64" => (Register(&["ra", "r31"]), 8, true),
            "mips" => (Register(&["ra", "r31"]), 4, true),
            "mips64el" => (Register(&["ra", "r31"]), 8, false),
            "mipsel" => (Register(&["ra", "r31"]), 4, false),
            _ => return None,
        };

        Some(Self {
            location,
            width,
            big_endian,
        })
    }

    /// Register names to look for, in order of preference.
    pub fn register_names(&self) -> &'static [&'static str] {
        match self.location {
            ReturnLocation::Register(names) | ReturnLocation::StackTop(names) => names,
        }
    }

    /// Decodes an address from target-ordered bytes, as read from a register or the stack.
    pub fn decode(&self, bytes: &[u8]) -> Option<u64> {
        let bytes = bytes.get(..self.width)?;
        let mut raw = [0u8; 8];
        let value = if self.big_endian {
            raw[8 - self.width..].copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        } else {
            raw[..self.width].copy_from_slice(bytes);
            u64::from_le_bytes(raw)
        };
        Some(value)
    }
}

/// A marker routine that a thread has called and that has not yet returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingMarker {
    pub marker: Marker,
    /// Where the call returns to, when it could be determined at entry.
    pub return_address: Option<u64>,
}

impl PendingMarker {
    /// Whether a block starting at `address` is the first one to run after the marker returned.
    ///
    /// Without a return address, leaving the marker routine counts as returning, which fires
    /// early if the marker calls out to other code.
    pub fn returns_at(&self, address: u64, markers: &Discovered) -> bool {
        match self.return_address {
            Some(return_address) => address == return_address,
            None => markers.marker_at(address).is_none(),
        }
    }
}

/// Looks up both marker routines in `image` and registers a transition for each one found.
///
/// Missing markers are not an error: nothing is registered for them and the gate keeps its
/// configured initial state.
pub fn discover<S, K>(image: &S, names: &MarkerNames, sink: &mut K) -> Discovered
where
    S: SymbolSource + ?Sized,
    K: MarkerSink + ?Sized,
{
    let _span = tracing::debug_span!("discover", image = image.name()).entered();

    let discovered = Discovered {
        enter: image.find_routine(&names.begin),
        exit: image.find_routine(&names.end),
    };

    if let Some(routine) = discovered.enter {
        tracing::debug! {
            symbol = names.begin.as_str(),
            address = %crate::log::Hex(routine.address),
            "found ROI begin marker"
        };
        sink.call_after(routine, Marker::Enter);
    }
    if let Some(routine) = discovered.exit {
        tracing::debug! {
            symbol = names.end.as_str(),
            address = %crate::log::Hex(routine.address),
            "found ROI end marker"
        };
        sink.call_after(routine, Marker::Exit);
    }
    if discovered.is_empty() {
        tracing::warn!("no ROI markers in image, capture follows the initial gate state");
    }

    discovered
}

/// Function symbols of an ELF image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    name: String,
    /// Routines at their link-time addresses.
    routines: HashMap<String, Routine>,
    entry: u64,
    position_independent: bool,
    bias: u64,
}

impl ElfImage {
    /// Reads the symbol table of the ELF file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| TraceError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path.display().to_string(), &data)
    }

    pub fn parse(name: String, data: &[u8]) -> Result<Self, TraceError> {
        let file = object::File::parse(data)?;

        let routines = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.is_definition())
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                let routine = Routine {
                    address: symbol.address(),
                    size: symbol.size(),
                };
                Some((String::from(name), routine))
            })
            .collect();

        Ok(Self {
            name,
            routines,
            entry: file.entry(),
            position_independent: file.kind() == ObjectKind::Dynamic,
            bias: 0,
        })
    }

    /// Whether the image can be loaded at any base (`ET_DYN`), as PIE executables are.
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    /// Returns `true` while a position-independent image still reports link-time addresses.
    pub fn is_unrelocated(&self) -> bool {
        self.position_independent && self.bias == 0
    }

    /// Entry point at the current load bias.
    pub fn entry(&self) -> u64 {
        self.entry.wrapping_add(self.bias)
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// Adds `bias` to every address reported from now on.
    pub fn set_bias(&mut self, bias: u64) {
        self.bias = bias;
    }

    /// Derives the load bias from the address the entry point was loaded at.
    ///
    /// Position-dependent images are loaded at their link address and keep a zero bias.
    pub fn relocate_to_entry(&mut self, loaded_entry: u64) -> u64 {
        if self.position_independent {
            self.bias = loaded_entry.wrapping_sub(self.entry);
        }
        self.bias
    }
}

impl SymbolSource for ElfImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_routine(&self, name: &str) -> Option<Routine> {
        let routine = self.routines.get(name)?;
        Some(Routine {
            address: routine.address.wrapping_add(self.bias),
            size: routine.size,
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    struct Table(Vec<(&'static str, Routine)>);

    impl SymbolSource for Table {
        fn name(&self) -> &str {
            "table"
        }

        fn find_routine(&self, name: &str) -> Option<Routine> {
            self.0.iter().find(|(n, _)| *n == name).map(|(_, r)| *r)
        }
    }

    #[derive(Default)]
    struct Calls(Vec<(Routine, Marker)>);

    impl MarkerSink for Calls {
        fn call_after(&mut self, routine: Routine, marker: Marker) {
            self.0.push((routine, marker));
        }
    }

    #[test]
    fn test_discover_both_markers() {
        let begin = Routine {
            address: 0x1000,
            size: 0x10,
        };
        let end = Routine {
            address: 0x1010,
            size: 0x10,
        };
        let main = Routine {
            address: 0x2000,
            size: 0x80,
        };
        let image = Table(vec![(ROI_BEGIN, begin), ("main", main), (ROI_END, end)]);

        let mut calls = Calls::default();
        let found = discover(&image, &MarkerNames::default(), &mut calls);

        assert_eq!(calls.0, vec![(begin, Marker::Enter), (end, Marker::Exit)]);
        assert_eq!(found.marker_at(0x1008), Some(Marker::Enter));
        assert_eq!(found.marker_at(0x1010), Some(Marker::Exit));
        assert_eq!(found.marker_at(0x2000), None);
    }

    #[test]
    fn test_missing_markers_register_nothing() {
        let image = Table(vec![("main", Routine { address: 0x2000, size: 0x80 })]);
        let mut calls = Calls::default();
        let found = discover(&image, &MarkerNames::default(), &mut calls);
        assert!(found.is_empty());
        assert!(calls.0.is_empty());
    }

    #[test]
    fn test_zero_sized_routine_owns_entry() {
        let routine = Routine {
            address: 0x500,
            size: 0,
        };
        assert!(routine.contains(0x500));
        assert!(!routine.contains(0x501));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let result = ElfImage::parse(String::from("junk"), b"definitely not an object file");
        assert!(matches!(result, Err(TraceError::Symbols(_))));
    }

    #[test]
    fn test_open_missing_file() {
        let result = ElfImage::open("/nonexistent/memtrace/image");
        assert!(matches!(result, Err(TraceError::Image { .. })));
    }

    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn memtrace_discovery_marker() -> u32 {
        std::hint::black_box(7)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_find_symbol_in_own_executable() {
        assert_eq!(memtrace_discovery_marker(), 7);
        let exe = std::env::current_exe().unwrap();
        let image = ElfImage::open(&exe).unwrap();
        let routine = image.find_routine("memtrace_discovery_marker");
        assert!(routine.is_some());
        assert!(image.find_routine(ROI_BEGIN).is_none());
    }

    #[cfg(target_os = "linux")]
    fn marker_address() -> u64 {
        memtrace_discovery_marker as extern "C" fn() -> u32 as usize as u64
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_relocated_image_matches_runtime_addresses() {
        let exe = std::env::current_exe().unwrap();
        let mut image = ElfImage::open(&exe).unwrap();
        if image.is_position_independent() {
            assert!(image.is_unrelocated());
        }

        let loaded_entry = unsafe { libc::getauxval(libc::AT_ENTRY) } as u64;
        image.relocate_to_entry(loaded_entry);
        assert_eq!(image.entry(), loaded_entry);

        let routine = image.find_routine("memtrace_discovery_marker").unwrap();
        assert_eq!(routine.address, marker_address());

        let found = Discovered {
            enter: Some(routine),
            exit: None,
        };
        assert_eq!(found.marker_at(marker_address()), Some(Marker::Enter));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_explicit_bias_shifts_routines() {
        let exe = std::env::current_exe().unwrap();
        let mut image = ElfImage::open(&exe).unwrap();
        let linked = image.find_routine("memtrace_discovery_marker").unwrap();

        image.set_bias(0x1000);
        let shifted = image.find_routine("memtrace_discovery_marker").unwrap();
        assert_eq!(shifted.address, linked.address + 0x1000);
        assert_eq!(shifted.size, linked.size);
        assert_eq!(image.bias(), 0x1000);
    }

    #[test]
    fn test_return_site_decoding() {
        let x86 = ReturnSite::for_target("x86_64").unwrap();
        assert_eq!(x86.location, ReturnLocation::StackTop(&["rsp"]));
        assert_eq!(
            x86.decode(&0x5555_5555_4abcu64.to_le_bytes()),
            Some(0x5555_5555_4abc)
        );

        let ppc = ReturnSite::for_target("ppc").unwrap();
        assert_eq!(ppc.register_names(), &["lr"]);
        assert_eq!(ppc.decode(&[0x10, 0x00, 0x04, 0x20]), Some(0x1000_0420));
        assert_eq!(ppc.decode(&[0x10, 0x00]), None);

        let arm = ReturnSite::for_target("arm").unwrap();
        assert_eq!(arm.decode(&[0x20, 0x04, 0x01, 0x00, 0xff]), Some(0x0001_0420));

        assert!(ReturnSite::for_target("hexagon").is_none());
    }

    #[test]
    fn test_pending_marker_waits_for_return_address() {
        let begin = Routine {
            address: 0x1000,
            size: 0x40,
        };
        let markers = Discovered {
            enter: Some(begin),
            exit: None,
        };
        let pending = PendingMarker {
            marker: Marker::Enter,
            return_address: Some(0x2014),
        };

        // the marker body and whatever it calls, such as a PLT stub, are still inside the call
        assert!(!pending.returns_at(0x1010, &markers));
        assert!(!pending.returns_at(0x3000, &markers));
        assert!(pending.returns_at(0x2014, &markers));

        let unknown = PendingMarker {
            marker: Marker::Enter,
            return_address: None,
        };
        assert!(!unknown.returns_at(0x1010, &markers));
        assert!(unknown.returns_at(0x3000, &markers));
    }
}
