// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-channel serialize/deserialize plug-in (§4.8), loaded from an
// in-memory ELF blob. The blob is written to an anonymous file
// descriptor (`memfd_create`) and opened as a shared object through
// `/proc/self/fd/<fd>`, exactly as the upstream loader does it — no
// `libloading`/`dlopen`-wrapper crate is introduced since `libc` already
// exposes `dlopen`/`dlsym`/`dlclose` directly and the upstream
// implementation calls them directly too.

use std::ffi::CString;
use std::io::Write;
use std::os::unix::io::RawFd;

use crate::error::{IoError, Result};

const SERIALIZE_SYMBOL: &str = "jbpf_io_serialize\0";
const DESERIALIZE_SYMBOL: &str = "jbpf_io_deserialize\0";

type SerializeFn = unsafe extern "C" fn(*mut u8, usize, *mut u8, usize) -> i32;
type DeserializeFn = unsafe extern "C" fn(*mut u8, usize, *mut u8, usize) -> i32;

/// A loaded codec plus the resources needed to unload it. A channel with
/// no plug-in is represented as `None` at the call site, not by an empty
/// `SerdePlugin` — `pack`/`unpack` reject that case directly.
pub struct SerdePlugin {
    name: String,
    fd: RawFd,
    handle: *mut libc::c_void,
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
}

unsafe impl Send for SerdePlugin {}
unsafe impl Sync for SerdePlugin {}

impl SerdePlugin {
    /// Write `blob` (a compiled shared object) to an anonymous `memfd`,
    /// named deterministically from `name_hint` (normally a stream-id's
    /// hex form), then `dlopen` it through `/proc/self/fd/<fd>` and
    /// resolve whichever of the two well-known symbols are present.
    pub fn load(name_hint: &str, blob: &[u8]) -> Result<Self> {
        let name = format!("jbpf_io_serde_{name_hint}");
        let fd = Self::open_mem_fd(&name)?;

        let mut file = std::fs::File::from(std::os::fd::OwnedFd::from_raw_fd_dup(fd)?);
        file.write_all(blob)?;
        std::mem::forget(file); // the dup'd fd closes; `fd` itself stays open for dlopen.

        let path = format!("/proc/self/fd/{fd}");
        let c_path = CString::new(path.clone()).map_err(|_| IoError::SerdeFailure("serde path contains NUL"))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            unsafe { libc::close(fd) };
            log::error!("serde: dlopen({path}) failed");
            return Err(IoError::SerdeFailure("dlopen failed"));
        }

        let serialize = unsafe { Self::resolve::<SerializeFn>(handle, SERIALIZE_SYMBOL) };
        let deserialize = unsafe { Self::resolve::<DeserializeFn>(handle, DESERIALIZE_SYMBOL) };
        if serialize.is_none() && deserialize.is_none() {
            log::error!("serde: neither jbpf_io_serialize nor jbpf_io_deserialize resolved in {name}");
        }

        log::info!("serde: loaded plug-in '{name}' (serialize={}, deserialize={})", serialize.is_some(), deserialize.is_some());
        Ok(Self { name, fd, handle, serialize, deserialize })
    }

    fn open_mem_fd(name: &str) -> Result<RawFd> {
        let c_name = CString::new(name).map_err(|_| IoError::SerdeFailure("serde name contains NUL"))?;
        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(fd)
    }

    unsafe fn resolve<F>(handle: *mut libc::c_void, symbol: &str) -> Option<F>
    where
        F: Copy,
    {
        debug_assert!(symbol.ends_with('\0'));
        let ptr = libc::dlsym(handle, symbol.as_ptr() as *const libc::c_char);
        if ptr.is_null() {
            return None;
        }
        Some(std::mem::transmute_copy::<*mut libc::c_void, F>(&ptr))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_serialize(&self) -> bool {
        self.serialize.is_some()
    }

    pub fn has_deserialize(&self) -> bool {
        self.deserialize.is_some()
    }

    /// Serialize `input` into `out`, returning the number of bytes
    /// written. Fails if this plug-in has no serializer, or if the
    /// underlying call reports a negative (truncated/failed) result.
    pub fn serialize(&self, input: &mut [u8], out: &mut [u8]) -> Result<usize> {
        let f = self.serialize.ok_or(IoError::SerdeFailure("no serializer loaded"))?;
        let n = unsafe { f(input.as_mut_ptr(), input.len(), out.as_mut_ptr(), out.len()) };
        if n < 0 {
            return Err(IoError::SerdeFailure("serialize call failed"));
        }
        Ok(n as usize)
    }

    /// Deserialize `input` into `out`, returning the number of bytes
    /// written.
    pub fn deserialize(&self, input: &mut [u8], out: &mut [u8]) -> Result<usize> {
        let f = self.deserialize.ok_or(IoError::SerdeFailure("no deserializer loaded"))?;
        let n = unsafe { f(input.as_mut_ptr(), input.len(), out.as_mut_ptr(), out.len()) };
        if n < 0 {
            return Err(IoError::SerdeFailure("deserialize call failed"));
        }
        Ok(n as usize)
    }
}

impl Drop for SerdePlugin {
    fn drop(&mut self) {
        unsafe {
            if !self.handle.is_null() {
                libc::dlclose(self.handle);
            }
            libc::close(self.fd);
        }
        log::info!("serde: unloaded plug-in '{}'", self.name);
    }
}

trait OwnedFdExt: Sized {
    fn from_raw_fd_dup(fd: RawFd) -> std::io::Result<Self>;
}

impl OwnedFdExt for std::os::fd::OwnedFd {
    fn from_raw_fd_dup(fd: RawFd) -> std::io::Result<Self> {
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(unsafe { <std::os::fd::OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(dup) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_blob_symbols_report_neither_serialize_nor_deserialize() {
        // A memfd holding an empty blob is not a valid ELF shared object,
        // so `dlopen` itself must fail and surface as `SerdeFailure`.
        let err = SerdePlugin::load("test_empty", &[]).unwrap_err();
        assert!(matches!(err, IoError::SerdeFailure(_)));
    }
}
