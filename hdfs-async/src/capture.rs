//! Error capture at the failing call site.
//!
//! These helpers run inside task bodies, on the worker thread, directly
//! after the blocking call. They turn a sentinel return into an
//! `ErrorOutcome` before anything else can touch the thread's error state.

use crate::driver::Driver;
use crate::error::Outcome;

/// Negative status means failure.
pub fn check_status<D: Driver + ?Sized>(driver: &D, rc: i32) -> Outcome<i32> {
    if rc < 0 {
        Err(driver.last_error())
    } else {
        Ok(rc)
    }
}

/// Negative offset or size means failure.
pub fn check_offset<D: Driver + ?Sized>(driver: &D, value: i64) -> Outcome<i64> {
    if value < 0 {
        Err(driver.last_error())
    } else {
        Ok(value)
    }
}

/// A missing handle means failure.
pub fn check_handle<D: Driver + ?Sized, T>(driver: &D, handle: Option<T>) -> Outcome<T> {
    handle.ok_or_else(|| driver.last_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{MemoryCluster, MemoryDriver};
    use crate::driver::{ConnectParams, NativePath};
    use std::ffi::CString;

    fn connect() -> (MemoryDriver, <MemoryDriver as Driver>::Fs) {
        let driver = MemoryDriver::new(MemoryCluster::builder().build());
        let params = ConnectParams {
            host: CString::new("default").unwrap(),
            port: 0,
            user: None,
            auth_token: None,
            kerb_ticket_cache_path: None,
        };
        let fs = driver.connect(&params).unwrap();
        (driver, fs)
    }

    #[test]
    fn failing_status_captures_code_and_message() {
        let (driver, fs) = connect();
        let path = NativePath::new("/nope").unwrap();
        let rc = driver.delete(&fs, path.as_c_str(), false);
        let err = check_status(&driver, rc).unwrap_err();
        assert_eq!(err.code, libc::ENOENT);
        assert!(err.message.contains("/nope"));
    }

    #[test]
    fn success_passes_value_through() {
        let (driver, fs) = connect();
        assert!(check_offset(&driver, driver.capacity(&fs)).unwrap() > 0);
        let path = NativePath::new("/").unwrap();
        let listing = check_handle(&driver, driver.path_info(&fs, path.as_c_str())).unwrap();
        assert_eq!(listing.len(), 1);
    }
}
