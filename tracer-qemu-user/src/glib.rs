use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

#[repr(C)]
pub struct GArray<T = i8> {
    data: *mut T,
    len: u32,
}

impl<T> GArray<T> {
    pub fn as_slice(&self) -> Option<&[T]> {
        if self.data.is_null() {
            return None;
        }

        Some(unsafe { std::slice::from_raw_parts(self.data, self.len as usize) })
    }
}

pub type GByteArray = GArray<u8>;

/// A pointer whose allocation was handed over by QEMU and must be released through glib.
#[repr(transparent)]
pub struct Owned<T: SpecializedDrop>(T);

impl Owned<*const c_char> {
    pub fn to_str(&self) -> Option<&str> {
        if self.0.is_null() {
            return None;
        }

        let c_str = unsafe { CStr::from_ptr(self.0) };

        let Ok(s) = c_str.to_str() else {
            tracing::warn!(string = ?c_str, "string contains non-UTF-8 characters");
            return None;
        };

        Some(s)
    }
}

impl<T> Owned<*mut GArray<T>> {
    pub fn as_slice(&self) -> Option<&[T]> {
        unsafe { self.0.as_ref().and_then(GArray::<T>::as_slice) }
    }
}

impl<T: SpecializedDrop> std::ops::Deref for Owned<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub trait SpecializedDrop: Sized {
    fn drop(owned: &mut Owned<Self>);
}

impl SpecializedDrop for *const c_char {
    fn drop(owned: &mut Owned<Self>) {
        if !owned.0.is_null() {
            unsafe {
                g_free(owned.0 as _);
            }
        }
    }
}

impl<T> SpecializedDrop for *mut GArray<T> {
    fn drop(owned: &mut Owned<Self>) {
        if !owned.0.is_null() {
            unsafe {
                g_array_free(owned.0 as _, true);
            }
        }
    }
}

impl<T: SpecializedDrop> Drop for Owned<T> {
    fn drop(&mut self) {
        <T as SpecializedDrop>::drop(self)
    }
}

extern "C" {
    pub fn g_free(_mem: *mut c_void);
    pub fn g_byte_array_new() -> Owned<*mut GByteArray>;
    pub fn g_array_free(_array: *mut GArray, _free_segment: bool) -> *mut c_char;
    pub fn g_byte_array_set_size(_array: *mut GByteArray, _length: u32) -> *mut GByteArray;
}
