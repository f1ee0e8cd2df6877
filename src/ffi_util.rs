use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

/// Conversion into a NUL-terminated C string for the exec boundary.
///
/// Interior NUL bytes cannot name a program, a file, or an environment
/// entry, so they are a caller bug and panic here.
pub trait ToCString {
    fn to_cstring(&self) -> CString;
}

impl<T: AsRef<OsStr>> ToCString for T {
    fn to_cstring(&self) -> CString {
        CString::new(self.as_ref().as_bytes()).expect("string with interior NUL")
    }
}
