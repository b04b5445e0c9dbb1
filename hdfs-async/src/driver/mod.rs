//! Native client interface.
//!
//! A `Driver` is the blocking, C-shaped filesystem library this crate
//! dispatches against. Every call either returns an integer status
//! (negative on failure), a 64-bit value (negative on failure) or an
//! optional handle (`None` on failure). The reason for a failure is only
//! available through [`Driver::last_error`], which reads thread-local
//! state and must therefore be called on the same thread, right after the
//! failing call.
//!
//! Implementations:
//! - `libhdfs3`: the libhdfs3 shared library, resolved at runtime
//! - `memory`: an in-process namenode used by tests and demos

pub mod libhdfs3;
pub mod memory;

use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::ops::Deref;

use crate::error::{Error, ErrorOutcome, Result};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    Append,
}

impl AccessMode {
    /// `open(2)`-style flags understood by the native library.
    pub fn flags(self) -> i32 {
        match self {
            AccessMode::ReadOnly => libc::O_RDONLY,
            AccessMode::WriteOnly => libc::O_WRONLY,
            AccessMode::Append => libc::O_WRONLY | libc::O_APPEND,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// A path validated for the native boundary (no interior NUL bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePath(CString);

impl NativePath {
    pub fn new(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("path must not be empty".into()));
        }
        Ok(Self(to_cstring("path", path)?))
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.0
    }

    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        self.0.to_string_lossy()
    }
}

pub(crate) fn to_cstring(what: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| Error::InvalidArgument(format!("{what} contains a NUL byte: {value:?}")))
}

/// Validated builder parameters for a connect call.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: CString,
    pub port: u16,
    pub user: Option<CString>,
    pub auth_token: Option<CString>,
    pub kerb_ticket_cache_path: Option<CString>,
}

impl ConnectParams {
    pub fn address(&self) -> String {
        let host = self.host.to_string_lossy();
        if self.port == 0 {
            host.into_owned()
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Field accessors over one native directory entry.
pub trait RawPathInfo {
    /// Object kind tag: `b'F'` for files, `b'D'` for directories.
    fn kind(&self) -> u8;
    fn name(&self) -> Cow<'_, str>;
    fn size(&self) -> i64;
    fn replication(&self) -> i16;
    fn block_size(&self) -> i64;
    fn owner(&self) -> Cow<'_, str>;
    fn group(&self) -> Cow<'_, str>;
    fn permissions(&self) -> i16;
    fn last_mod(&self) -> i64;
    fn last_access(&self) -> i64;
}

/// Field accessors over one native HA namenode record.
pub trait RawNamenode {
    fn rpc_address(&self) -> Cow<'_, str>;
    fn http_address(&self) -> Cow<'_, str>;
}

pub trait Driver: Send + Sync + 'static {
    /// Connected filesystem handle.
    type Fs: Send + Sync + 'static;
    /// Open file handle.
    type File: Send + Sync + 'static;
    type Entry: RawPathInfo;
    /// Native entry array; dropping it releases the native memory.
    type Listing: Deref<Target = [Self::Entry]> + Send;
    type Namenode: RawNamenode;
    /// Native namenode array; dropping it releases the native memory.
    type Namenodes: Deref<Target = [Self::Namenode]> + Send;

    /// Snapshot of the calling thread's last error.
    fn last_error(&self) -> ErrorOutcome;

    fn connect(&self, params: &ConnectParams) -> Option<Self::Fs>;
    fn disconnect(&self, fs: Self::Fs) -> i32;

    /// 0 when the path exists.
    fn exists(&self, fs: &Self::Fs, path: &CStr) -> i32;
    fn rename(&self, fs: &Self::Fs, from: &CStr, to: &CStr) -> i32;
    fn create_directory(&self, fs: &Self::Fs, path: &CStr) -> i32;
    fn delete(&self, fs: &Self::Fs, path: &CStr, recursive: bool) -> i32;
    fn set_replication(&self, fs: &Self::Fs, path: &CStr, replication: i16) -> i32;
    /// `None` leaves the field unchanged.
    fn chown(&self, fs: &Self::Fs, path: &CStr, owner: Option<&CStr>, group: Option<&CStr>)
    -> i32;
    fn chmod(&self, fs: &Self::Fs, path: &CStr, mode: i16) -> i32;
    /// -1 leaves a timestamp unchanged.
    fn utime(&self, fs: &Self::Fs, path: &CStr, mtime: i64, atime: i64) -> i32;
    /// `should_wait` is set to non-zero when block recovery must finish
    /// before the file can be reopened.
    fn truncate(&self, fs: &Self::Fs, path: &CStr, pos: i64, should_wait: &mut i32) -> i32;
    /// Writes a NUL-terminated path into `buf`, returning its length.
    fn working_directory(&self, fs: &Self::Fs, buf: &mut [u8]) -> Option<usize>;
    fn set_working_directory(&self, fs: &Self::Fs, path: &CStr) -> i32;
    fn default_block_size(&self, fs: &Self::Fs) -> i64;
    fn capacity(&self, fs: &Self::Fs) -> i64;
    fn used(&self, fs: &Self::Fs) -> i64;
    fn list_directory(&self, fs: &Self::Fs, path: &CStr) -> Option<Self::Listing>;
    /// A listing with exactly one entry.
    fn path_info(&self, fs: &Self::Fs, path: &CStr) -> Option<Self::Listing>;

    fn open_file(
        &self,
        fs: &Self::Fs,
        path: &CStr,
        mode: AccessMode,
        buffer_size: i32,
        replication: i16,
        block_size: i64,
    ) -> Option<Self::File>;
    fn close_file(&self, fs: &Self::Fs, file: Self::File) -> i32;
    /// Bytes read, 0 at end of file.
    fn read(&self, fs: &Self::Fs, file: &Self::File, buf: &mut [u8]) -> i32;
    fn write(&self, fs: &Self::Fs, file: &Self::File, buf: &[u8]) -> i32;
    fn flush(&self, fs: &Self::Fs, file: &Self::File) -> i32;
    fn hflush(&self, fs: &Self::Fs, file: &Self::File) -> i32;
    fn sync(&self, fs: &Self::Fs, file: &Self::File) -> i32;

    fn ha_namenodes(&self, service: &CStr) -> Option<Self::Namenodes>;
}
