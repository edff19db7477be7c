//! Reference Clock Adapter (component A): a strictly non-decreasing
//! nanosecond count from a hardware-backed monotonic raw source.

use std::ffi::CStr;
use std::io::{Error, Result};

/// Reads `CLOCK_MONOTONIC_RAW`, in nanoseconds.
///
/// This is the "ground truth" the rest of the clock disciplines itself
/// against. It is never itself steered: there is deliberately no public
/// way to step or re-rate this function's output, only to read it.
pub fn now_ref_ns() -> Result<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `ts` is a valid, uniquely-owned `timespec` the kernel writes
    // into; `CLOCK_MONOTONIC_RAW` is a fixed, always-valid clock id.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    if rc == -1 {
        return Err(Error::last_os_error());
    }
    Ok(ts.tv_sec * 1_000_000_000 + ts.tv_nsec as i64)
}

/// `sysname`, `release`, `machine` from `uname(2)`, used only to fill in
/// the CSV metadata header's `kernel`/`architecture` lines (component H).
/// Never on a hot path; failures fall back to `"unknown"` rather than
/// propagating, since a missing kernel string should not stop a session
/// from starting.
pub struct HostInfo {
    pub kernel: String,
    pub arch: String,
}

pub fn host_info() -> HostInfo {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // Safety: `uts` is a valid, uniquely-owned `utsname` the kernel fills
    // in; failure is reported via a non-zero return, handled below.
    let rc = unsafe { libc::uname(&mut uts) };
    if rc != 0 {
        return HostInfo {
            kernel: "unknown".to_string(),
            arch: "unknown".to_string(),
        };
    }
    let to_string = |bytes: &[libc::c_char]| -> String {
        let ptr = bytes.as_ptr();
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    };
    let release = to_string(&uts.release);
    let machine = to_string(&uts.machine);
    HostInfo {
        kernel: release,
        arch: machine,
    }
}
