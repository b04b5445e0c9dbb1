//! libhdfs3, resolved at runtime.
//!
//! The shared library is opened with `libloading`, so nothing links
//! against it at build time; every entry point is looked up once when the
//! driver is created.

use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::ops::Deref;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use libloading::Library;
use log::info;

use super::{AccessMode, ConnectParams, Driver, RawNamenode, RawPathInfo};
use crate::error::{ErrorOutcome, Result};

pub const DEFAULT_LIBRARY: &str = "libhdfs3.so";

type Handle = *mut c_void;

/// `hdfsFileInfo`.
#[repr(C)]
pub struct FileInfo {
    kind: c_int,
    name: *mut c_char,
    last_mod: i64,
    size: i64,
    replication: i16,
    block_size: i64,
    owner: *mut c_char,
    group: *mut c_char,
    permissions: i16,
    last_access: i64,
}

/// `Namenode`.
#[repr(C)]
pub struct Namenode {
    rpc_addr: *mut c_char,
    http_addr: *mut c_char,
}

fn c_text(p: *const c_char) -> Cow<'static, str> {
    if p.is_null() {
        return Cow::Borrowed("");
    }
    // SAFETY: non-null strings in library structs are NUL-terminated and
    // live as long as the array that holds them; callers only reach them
    // through that array.
    Cow::Owned(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
}

impl RawPathInfo for FileInfo {
    fn kind(&self) -> u8 {
        self.kind as u8
    }
    fn name(&self) -> Cow<'_, str> {
        c_text(self.name)
    }
    fn size(&self) -> i64 {
        self.size
    }
    fn replication(&self) -> i16 {
        self.replication
    }
    fn block_size(&self) -> i64 {
        self.block_size
    }
    fn owner(&self) -> Cow<'_, str> {
        c_text(self.owner)
    }
    fn group(&self) -> Cow<'_, str> {
        c_text(self.group)
    }
    fn permissions(&self) -> i16 {
        self.permissions
    }
    fn last_mod(&self) -> i64 {
        self.last_mod
    }
    fn last_access(&self) -> i64 {
        self.last_access
    }
}

impl RawNamenode for Namenode {
    fn rpc_address(&self) -> Cow<'_, str> {
        c_text(self.rpc_addr)
    }
    fn http_address(&self) -> Cow<'_, str> {
        c_text(self.http_addr)
    }
}

macro_rules! symbols {
    ($($field:ident = $symbol:literal: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        struct Symbols {
            $($field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl Symbols {
            /// # Safety
            /// `lib` must be libhdfs3 and must outlive the returned table.
            unsafe fn load(lib: &Library) -> std::result::Result<Self, libloading::Error> {
                Ok(Self {
                    $($field: unsafe {
                        *lib.get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                            concat!($symbol, "\0").as_bytes(),
                        )?
                    },)*
                })
            }
        }
    };
}

symbols! {
    new_builder = "hdfsNewBuilder": fn() -> Handle;
    builder_set_name_node = "hdfsBuilderSetNameNode": fn(Handle, *const c_char);
    builder_set_name_node_port = "hdfsBuilderSetNameNodePort": fn(Handle, u16);
    builder_set_user_name = "hdfsBuilderSetUserName": fn(Handle, *const c_char);
    builder_set_kerb_ticket_cache_path = "hdfsBuilderSetKerbTicketCachePath": fn(Handle, *const c_char);
    builder_set_token = "hdfsBuilderSetToken": fn(Handle, *const c_char);
    builder_connect = "hdfsBuilderConnect": fn(Handle) -> Handle;
    free_builder = "hdfsFreeBuilder": fn(Handle);
    disconnect = "hdfsDisconnect": fn(Handle) -> c_int;
    exists = "hdfsExists": fn(Handle, *const c_char) -> c_int;
    rename = "hdfsRename": fn(Handle, *const c_char, *const c_char) -> c_int;
    get_working_directory = "hdfsGetWorkingDirectory": fn(Handle, *mut c_char, usize) -> *mut c_char;
    set_working_directory = "hdfsSetWorkingDirectory": fn(Handle, *const c_char) -> c_int;
    create_directory = "hdfsCreateDirectory": fn(Handle, *const c_char) -> c_int;
    delete = "hdfsDelete": fn(Handle, *const c_char, c_int) -> c_int;
    set_replication = "hdfsSetReplication": fn(Handle, *const c_char, i16) -> c_int;
    chown = "hdfsChown": fn(Handle, *const c_char, *const c_char, *const c_char) -> c_int;
    chmod = "hdfsChmod": fn(Handle, *const c_char, i16) -> c_int;
    utime = "hdfsUtime": fn(Handle, *const c_char, i64, i64) -> c_int;
    truncate = "hdfsTruncate": fn(Handle, *const c_char, i64, *mut c_int) -> c_int;
    list_directory = "hdfsListDirectory": fn(Handle, *const c_char, *mut c_int) -> *mut FileInfo;
    get_path_info = "hdfsGetPathInfo": fn(Handle, *const c_char) -> *mut FileInfo;
    free_file_info = "hdfsFreeFileInfo": fn(*mut FileInfo, c_int);
    get_default_block_size = "hdfsGetDefaultBlockSize": fn(Handle) -> i64;
    get_capacity = "hdfsGetCapacity": fn(Handle) -> i64;
    get_used = "hdfsGetUsed": fn(Handle) -> i64;
    open_file = "hdfsOpenFile": fn(Handle, *const c_char, c_int, c_int, i16, i64) -> Handle;
    close_file = "hdfsCloseFile": fn(Handle, Handle) -> c_int;
    read = "hdfsRead": fn(Handle, Handle, *mut c_void, i32) -> i32;
    write = "hdfsWrite": fn(Handle, Handle, *const c_void, i32) -> i32;
    flush = "hdfsFlush": fn(Handle, Handle) -> c_int;
    hflush = "hdfsHFlush": fn(Handle, Handle) -> c_int;
    sync = "hdfsSync": fn(Handle, Handle) -> c_int;
    get_last_error = "hdfsGetLastError": fn() -> *const c_char;
    get_ha_namenodes = "hdfsGetHANamenodes": fn(*const c_char, *mut c_int) -> *mut Namenode;
    free_namenode_information = "hdfsFreeNamenodeInformation": fn(*mut Namenode, c_int);
}

struct Api {
    // Declared before `_lib` so the table is dropped first.
    sym: Symbols,
    _lib: Library,
}

/// A connected `hdfsFS`.
pub struct HdfsFs(NonNull<c_void>);

// SAFETY: libhdfs3 filesystem handles may be used from several threads at
// once; the handle is only released through `Driver::disconnect`, which
// consumes it.
unsafe impl Send for HdfsFs {}
unsafe impl Sync for HdfsFs {}

/// An open `hdfsFile`.
pub struct HdfsFile(NonNull<c_void>);

// SAFETY: the handle is released only through `Driver::close_file`, which
// consumes it. Concurrent transfers on one file are the caller's to order.
unsafe impl Send for HdfsFile {}
unsafe impl Sync for HdfsFile {}

/// Array returned by `hdfsListDirectory` or `hdfsGetPathInfo`, freed on drop.
pub struct FileInfoArray {
    ptr: NonNull<FileInfo>,
    len: usize,
    api: Arc<Api>,
}

// SAFETY: the array is exclusively owned and only read after creation.
unsafe impl Send for FileInfoArray {}

impl Deref for FileInfoArray {
    type Target = [FileInfo];

    fn deref(&self) -> &[FileInfo] {
        // SAFETY: the library returned `len` contiguous entries at `ptr`,
        // valid until `hdfsFreeFileInfo`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for FileInfoArray {
    fn drop(&mut self) {
        // SAFETY: freed exactly once, with the count it was returned with.
        unsafe { (self.api.sym.free_file_info)(self.ptr.as_ptr(), self.len as c_int) }
    }
}

/// Array returned by `hdfsGetHANamenodes`, freed on drop.
pub struct NamenodeArray {
    ptr: NonNull<Namenode>,
    len: usize,
    api: Arc<Api>,
}

// SAFETY: see `FileInfoArray`.
unsafe impl Send for NamenodeArray {}

impl Deref for NamenodeArray {
    type Target = [Namenode];

    fn deref(&self) -> &[Namenode] {
        // SAFETY: as for `FileInfoArray`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for NamenodeArray {
    fn drop(&mut self) {
        // SAFETY: freed exactly once, with the count it was returned with.
        unsafe { (self.api.sym.free_namenode_information)(self.ptr.as_ptr(), self.len as c_int) }
    }
}

fn opt_ptr(s: Option<&CStr>) -> *const c_char {
    s.map_or(ptr::null(), CStr::as_ptr)
}

#[derive(Clone)]
pub struct Libhdfs3Driver {
    api: Arc<Api>,
}

impl Libhdfs3Driver {
    /// Open the shared library at `library` and resolve every entry point.
    ///
    /// `conf` is exported as `LIBHDFS3_CONF` first, since the library reads
    /// it when the first builder is created.
    pub fn load(library: &Path, conf: Option<&Path>) -> Result<Self> {
        if let Some(conf) = conf {
            info!("using hdfs client configuration {}", conf.display());
            // SAFETY: runs during client setup, before the library is loaded
            // and before any worker thread could read the environment.
            unsafe { std::env::set_var("LIBHDFS3_CONF", conf) };
        }
        // SAFETY: loading libhdfs3 runs no initialisers with preconditions.
        let lib = unsafe { Library::new(library) }?;
        // SAFETY: `lib` is stored next to the table and outlives it.
        let sym = unsafe { Symbols::load(&lib) }?;
        info!("loaded {}", library.display());
        Ok(Self {
            api: Arc::new(Api { sym, _lib: lib }),
        })
    }

    fn sym(&self) -> &Symbols {
        &self.api.sym
    }

    /// Symbols for a native call. Resets errno so a failure that does not
    /// set it is not reported with a code left over from an earlier call.
    fn enter(&self) -> &Symbols {
        clear_errno();
        &self.api.sym
    }
}

fn clear_errno() {
    // SAFETY: errno is thread-local and always writable.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        *libc::__errno_location() = 0;
    }
    // SAFETY: as above.
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = 0;
    }
}

impl Driver for Libhdfs3Driver {
    type Fs = HdfsFs;
    type File = HdfsFile;
    type Entry = FileInfo;
    type Listing = FileInfoArray;
    type Namenode = Namenode;
    type Namenodes = NamenodeArray;

    fn last_error(&self) -> ErrorOutcome {
        // errno first: fetching the message may overwrite it.
        let code = std::io::Error::last_os_error()
            .raw_os_error()
            .filter(|c| *c != 0)
            .unwrap_or(libc::EIO);
        // SAFETY: returns a thread-local, NUL-terminated string or null.
        let message = c_text(unsafe { (self.sym().get_last_error)() });
        ErrorOutcome::new(code, message)
    }

    fn connect(&self, params: &ConnectParams) -> Option<HdfsFs> {
        let s = self.enter();
        // SAFETY: the builder is used only here and freed after the connect
        // attempt; every string outlives the calls that read it.
        unsafe {
            let builder = (s.new_builder)();
            if builder.is_null() {
                return None;
            }
            (s.builder_set_name_node)(builder, params.host.as_ptr());
            if params.port != 0 {
                (s.builder_set_name_node_port)(builder, params.port);
            }
            if let Some(user) = &params.user {
                (s.builder_set_user_name)(builder, user.as_ptr());
            }
            if let Some(token) = &params.auth_token {
                (s.builder_set_token)(builder, token.as_ptr());
            }
            if let Some(path) = &params.kerb_ticket_cache_path {
                (s.builder_set_kerb_ticket_cache_path)(builder, path.as_ptr());
            }
            let fs = (s.builder_connect)(builder);
            (s.free_builder)(builder);
            NonNull::new(fs).map(HdfsFs)
        }
    }

    fn disconnect(&self, fs: HdfsFs) -> i32 {
        // SAFETY: `fs` is consumed, so it cannot be used again.
        unsafe { (self.enter().disconnect)(fs.0.as_ptr()) }
    }

    fn exists(&self, fs: &HdfsFs, path: &CStr) -> i32 {
        // SAFETY: valid handle and NUL-terminated path.
        unsafe { (self.enter().exists)(fs.0.as_ptr(), path.as_ptr()) }
    }

    fn rename(&self, fs: &HdfsFs, from: &CStr, to: &CStr) -> i32 {
        // SAFETY: as above.
        unsafe { (self.enter().rename)(fs.0.as_ptr(), from.as_ptr(), to.as_ptr()) }
    }

    fn create_directory(&self, fs: &HdfsFs, path: &CStr) -> i32 {
        // SAFETY: as above.
        unsafe { (self.enter().create_directory)(fs.0.as_ptr(), path.as_ptr()) }
    }

    fn delete(&self, fs: &HdfsFs, path: &CStr, recursive: bool) -> i32 {
        // SAFETY: as above.
        unsafe { (self.enter().delete)(fs.0.as_ptr(), path.as_ptr(), c_int::from(recursive)) }
    }

    fn set_replication(&self, fs: &HdfsFs, path: &CStr, replication: i16) -> i32 {
        // SAFETY: as above.
        unsafe { (self.enter().set_replication)(fs.0.as_ptr(), path.as_ptr(), replication) }
    }

    fn chown(&self, fs: &HdfsFs, path: &CStr, owner: Option<&CStr>, group: Option<&CStr>) -> i32 {
        // SAFETY: null leaves the field unchanged.
        unsafe {
            (self.enter().chown)(fs.0.as_ptr(), path.as_ptr(), opt_ptr(owner), opt_ptr(group))
        }
    }

    fn chmod(&self, fs: &HdfsFs, path: &CStr, mode: i16) -> i32 {
        // SAFETY: valid handle and NUL-terminated path.
        unsafe { (self.enter().chmod)(fs.0.as_ptr(), path.as_ptr(), mode) }
    }

    fn utime(&self, fs: &HdfsFs, path: &CStr, mtime: i64, atime: i64) -> i32 {
        // SAFETY: as above.
        unsafe { (self.enter().utime)(fs.0.as_ptr(), path.as_ptr(), mtime, atime) }
    }

    fn truncate(&self, fs: &HdfsFs, path: &CStr, pos: i64, should_wait: &mut i32) -> i32 {
        // SAFETY: `should_wait` is a valid out-parameter for the call.
        unsafe { (self.enter().truncate)(fs.0.as_ptr(), path.as_ptr(), pos, should_wait) }
    }

    fn working_directory(&self, fs: &HdfsFs, buf: &mut [u8]) -> Option<usize> {
        // SAFETY: the library writes at most `buf.len()` bytes.
        let p = unsafe {
            (self.enter().get_working_directory)(fs.0.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        if p.is_null() {
            return None;
        }
        buf.iter().position(|b| *b == 0)
    }

    fn set_working_directory(&self, fs: &HdfsFs, path: &CStr) -> i32 {
        // SAFETY: valid handle and NUL-terminated path.
        unsafe { (self.enter().set_working_directory)(fs.0.as_ptr(), path.as_ptr()) }
    }

    fn default_block_size(&self, fs: &HdfsFs) -> i64 {
        // SAFETY: valid handle.
        unsafe { (self.enter().get_default_block_size)(fs.0.as_ptr()) }
    }

    fn capacity(&self, fs: &HdfsFs) -> i64 {
        // SAFETY: valid handle.
        unsafe { (self.enter().get_capacity)(fs.0.as_ptr()) }
    }

    fn used(&self, fs: &HdfsFs) -> i64 {
        // SAFETY: valid handle.
        unsafe { (self.enter().get_used)(fs.0.as_ptr()) }
    }

    fn list_directory(&self, fs: &HdfsFs, path: &CStr) -> Option<FileInfoArray> {
        let mut n: c_int = 0;
        // SAFETY: `n` receives the entry count.
        let p = unsafe { (self.enter().list_directory)(fs.0.as_ptr(), path.as_ptr(), &mut n) };
        NonNull::new(p).map(|ptr| FileInfoArray {
            ptr,
            len: n.max(0) as usize,
            api: self.api.clone(),
        })
    }

    fn path_info(&self, fs: &HdfsFs, path: &CStr) -> Option<FileInfoArray> {
        // SAFETY: valid handle and NUL-terminated path.
        let p = unsafe { (self.enter().get_path_info)(fs.0.as_ptr(), path.as_ptr()) };
        NonNull::new(p).map(|ptr| FileInfoArray {
            ptr,
            len: 1,
            api: self.api.clone(),
        })
    }

    fn open_file(
        &self,
        fs: &HdfsFs,
        path: &CStr,
        mode: AccessMode,
        buffer_size: i32,
        replication: i16,
        block_size: i64,
    ) -> Option<HdfsFile> {
        // SAFETY: valid handle and NUL-terminated path.
        let f = unsafe {
            (self.enter().open_file)(
                fs.0.as_ptr(),
                path.as_ptr(),
                mode.flags(),
                buffer_size,
                replication,
                block_size,
            )
        };
        NonNull::new(f).map(HdfsFile)
    }

    fn close_file(&self, fs: &HdfsFs, file: HdfsFile) -> i32 {
        // SAFETY: `file` is consumed, so it cannot be used again.
        unsafe { (self.enter().close_file)(fs.0.as_ptr(), file.0.as_ptr()) }
    }

    fn read(&self, fs: &HdfsFs, file: &HdfsFile, buf: &mut [u8]) -> i32 {
        let len = buf.len().min(i32::MAX as usize) as i32;
        // SAFETY: the library writes at most `len` bytes into `buf`.
        unsafe { (self.enter().read)(fs.0.as_ptr(), file.0.as_ptr(), buf.as_mut_ptr().cast(), len) }
    }

    fn write(&self, fs: &HdfsFs, file: &HdfsFile, buf: &[u8]) -> i32 {
        let len = buf.len().min(i32::MAX as usize) as i32;
        // SAFETY: the library reads at most `len` bytes from `buf`.
        unsafe { (self.enter().write)(fs.0.as_ptr(), file.0.as_ptr(), buf.as_ptr().cast(), len) }
    }

    fn flush(&self, fs: &HdfsFs, file: &HdfsFile) -> i32 {
        // SAFETY: valid handles.
        unsafe { (self.enter().flush)(fs.0.as_ptr(), file.0.as_ptr()) }
    }

    fn hflush(&self, fs: &HdfsFs, file: &HdfsFile) -> i32 {
        // SAFETY: valid handles.
        unsafe { (self.enter().hflush)(fs.0.as_ptr(), file.0.as_ptr()) }
    }

    fn sync(&self, fs: &HdfsFs, file: &HdfsFile) -> i32 {
        // SAFETY: valid handles.
        unsafe { (self.enter().sync)(fs.0.as_ptr(), file.0.as_ptr()) }
    }

    fn ha_namenodes(&self, service: &CStr) -> Option<NamenodeArray> {
        let mut n: c_int = 0;
        // SAFETY: `n` receives the entry count.
        let p = unsafe { (self.enter().get_ha_namenodes)(service.as_ptr(), &mut n) };
        NonNull::new(p).map(|ptr| NamenodeArray {
            ptr,
            len: n.max(0) as usize,
            api: self.api.clone(),
        })
    }
}
