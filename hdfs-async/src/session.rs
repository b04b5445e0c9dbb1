//! Filesystem sessions.
//!
//! A [`Session`] owns one connected native filesystem handle. Every path
//! operation validates its arguments on the caller's thread, then queues a
//! single blocking call on the dispatcher and returns the [`Task`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::capture::{check_handle, check_offset, check_status};
use crate::config::{ClientConfig, ConnectOptions, DEFAULT_MAX_PATH_LENGTH};
use crate::dispatch::{Dispatcher, Task};
use crate::driver::{Driver, NativePath, to_cstring};
use crate::error::{Error, ErrorOutcome, Outcome, Result};
use crate::file::{FileReader, FileWriter, WriteOptions};
use crate::meta::PathInfo;
use crate::resource::{Release, Resource};

/// Result of a truncate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// The file has its new length and can be reopened right away.
    Done,
    /// Block recovery is running; wait for it before reopening the file.
    AwaitRecovery,
}

pub(crate) struct NativeFs<D: Driver> {
    pub(crate) driver: D,
    pub(crate) fs: D::Fs,
}

impl<D: Driver> Release for NativeFs<D> {
    const KIND: &'static str = "filesystem";

    fn release(self) -> Outcome<()> {
        let rc = self.driver.disconnect(self.fs);
        check_status(&self.driver, rc).map(drop)
    }
}

/// State shared by a session, its tasks and its open files. The native
/// handle is disconnected when the last of them lets go.
pub(crate) struct SessionCore<D: Driver> {
    native: Resource<NativeFs<D>>,
    closed: AtomicBool,
}

impl<D: Driver> SessionCore<D> {
    pub(crate) fn native(&self) -> Outcome<&NativeFs<D>> {
        self.native
            .get()
            .ok_or_else(|| ErrorOutcome::bad_handle(self.native.label()))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection to one namenode (or HA nameservice).
pub struct Session<D: Driver> {
    core: Option<Arc<SessionCore<D>>>,
    dispatcher: Dispatcher,
    address: String,
    max_path_length: usize,
}

impl<D: Driver> Session<D> {
    /// Connect on the calling thread. On failure no session exists.
    pub fn connect(driver: D, dispatcher: Dispatcher, options: &ConnectOptions) -> Result<Self> {
        let params = options.params()?;
        let address = params.address();
        let fs = check_handle(&driver, driver.connect(&params)).map_err(|source| {
            Error::Connect {
                address: address.clone(),
                source,
            }
        })?;
        info!("connected to {address}");
        let core = SessionCore {
            native: Resource::new(NativeFs { driver, fs }, address.clone()),
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            core: Some(Arc::new(core)),
            dispatcher,
            address,
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
        })
    }

    /// Connect with a dispatcher built from `config`.
    pub fn from_config(driver: D, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(&config.dispatch)?;
        Ok(Self::connect(driver, dispatcher, &config.namenode)?
            .with_max_path_length(config.max_path_length))
    }

    /// Buffer size used by [`Session::working_directory`].
    pub fn with_max_path_length(mut self, len: usize) -> Self {
        self.max_path_length = len.max(1);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_closed(&self) -> bool {
        self.core.as_ref().is_none_or(|core| core.is_closed())
    }

    pub(crate) fn live(&self) -> Result<Arc<SessionCore<D>>> {
        match &self.core {
            Some(core) if !core.is_closed() => Ok(core.clone()),
            _ => Err(Error::SessionClosed),
        }
    }

    fn submit<T, F>(&self, op: &'static str, body: F) -> Result<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce(&D, &D::Fs) -> Outcome<T> + Send + 'static,
    {
        let core = self.live()?;
        Ok(self.dispatcher.run(op, move || {
            let native = core.native()?;
            body(&native.driver, &native.fs)
        }))
    }

    fn status_op<F>(&self, op: &'static str, call: F) -> Result<Task<()>>
    where
        F: FnOnce(&D, &D::Fs) -> i32 + Send + 'static,
    {
        self.submit(op, move |driver, fs| {
            check_status(driver, call(driver, fs)).map(drop)
        })
    }

    /// `false` for a missing path; never fails.
    pub fn exists(&self, path: &str) -> Result<Task<bool>> {
        let path = NativePath::new(path)?;
        self.submit("exists", move |driver, fs| {
            Ok(driver.exists(fs, path.as_c_str()) == 0)
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<Task<()>> {
        let from = NativePath::new(from)?;
        let to = NativePath::new(to)?;
        self.status_op("rename", move |driver, fs| {
            driver.rename(fs, from.as_c_str(), to.as_c_str())
        })
    }

    /// Creates missing parents as well.
    pub fn create_directory(&self, path: &str) -> Result<Task<()>> {
        let path = NativePath::new(path)?;
        self.status_op("create_directory", move |driver, fs| {
            driver.create_directory(fs, path.as_c_str())
        })
    }

    pub fn delete(&self, path: &str, recursive: bool) -> Result<Task<()>> {
        let path = NativePath::new(path)?;
        self.status_op("delete", move |driver, fs| {
            driver.delete(fs, path.as_c_str(), recursive)
        })
    }

    pub fn set_replication(&self, path: &str, replication: i16) -> Result<Task<()>> {
        if replication <= 0 {
            return Err(Error::InvalidArgument(format!(
                "replication must be positive, got {replication}"
            )));
        }
        let path = NativePath::new(path)?;
        self.status_op("set_replication", move |driver, fs| {
            driver.set_replication(fs, path.as_c_str(), replication)
        })
    }

    /// `None` leaves that field unchanged; at least one must be given.
    pub fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> Result<Task<()>> {
        if owner.is_none() && group.is_none() {
            return Err(Error::InvalidArgument(
                "chown needs an owner or a group".into(),
            ));
        }
        let path = NativePath::new(path)?;
        let owner = owner.map(|o| to_cstring("owner", o)).transpose()?;
        let group = group.map(|g| to_cstring("group", g)).transpose()?;
        self.status_op("chown", move |driver, fs| {
            driver.chown(fs, path.as_c_str(), owner.as_deref(), group.as_deref())
        })
    }

    pub fn chmod(&self, path: &str, mode: i16) -> Result<Task<()>> {
        let path = NativePath::new(path)?;
        self.status_op("chmod", move |driver, fs| {
            driver.chmod(fs, path.as_c_str(), mode)
        })
    }

    /// Times are seconds since the epoch; `None` leaves one unchanged.
    pub fn utime(&self, path: &str, mtime: Option<i64>, atime: Option<i64>) -> Result<Task<()>> {
        let path = NativePath::new(path)?;
        let mtime = mtime.unwrap_or(-1);
        let atime = atime.unwrap_or(-1);
        self.status_op("utime", move |driver, fs| {
            driver.utime(fs, path.as_c_str(), mtime, atime)
        })
    }

    pub fn truncate(&self, path: &str, length: i64) -> Result<Task<Truncation>> {
        if length < 0 {
            return Err(Error::InvalidArgument(format!(
                "truncate length must not be negative, got {length}"
            )));
        }
        let path = NativePath::new(path)?;
        self.submit("truncate", move |driver, fs| {
            let mut should_wait = 0;
            let rc = driver.truncate(fs, path.as_c_str(), length, &mut should_wait);
            check_status(driver, rc)?;
            Ok(if should_wait != 0 {
                Truncation::AwaitRecovery
            } else {
                Truncation::Done
            })
        })
    }

    pub fn working_directory(&self) -> Result<Task<String>> {
        let capacity = self.max_path_length;
        self.submit("working_directory", move |driver, fs| {
            let mut buf = vec![0u8; capacity];
            let len = check_handle(driver, driver.working_directory(fs, &mut buf))?;
            Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
        })
    }

    pub fn set_working_directory(&self, path: &str) -> Result<Task<()>> {
        let path = NativePath::new(path)?;
        self.status_op("set_working_directory", move |driver, fs| {
            driver.set_working_directory(fs, path.as_c_str())
        })
    }

    pub fn default_block_size(&self) -> Result<Task<i64>> {
        self.submit("default_block_size", |driver, fs| {
            check_offset(driver, driver.default_block_size(fs))
        })
    }

    /// Raw capacity of the cluster in bytes.
    pub fn capacity(&self) -> Result<Task<i64>> {
        self.submit("capacity", |driver, fs| {
            check_offset(driver, driver.capacity(fs))
        })
    }

    /// Bytes in use across the cluster.
    pub fn used(&self) -> Result<Task<i64>> {
        self.submit("used", |driver, fs| check_offset(driver, driver.used(fs)))
    }

    /// Entries of a directory, or the file itself when `path` is a file.
    pub fn list(&self, path: &str) -> Result<Task<Vec<PathInfo>>> {
        let path = NativePath::new(path)?;
        self.submit("list", move |driver, fs| {
            let listing = check_handle(driver, driver.list_directory(fs, path.as_c_str()))?;
            Ok(listing.iter().map(PathInfo::from_listed).collect())
        })
    }

    pub fn path_info(&self, path: &str) -> Result<Task<PathInfo>> {
        let path = NativePath::new(path)?;
        self.submit("path_info", move |driver, fs| stat(driver, fs, &path))
    }

    pub fn is_directory(&self, path: &str) -> Result<Task<bool>> {
        let path = NativePath::new(path)?;
        self.submit("is_directory", move |driver, fs| {
            stat(driver, fs, &path).map(|info| info.is_directory())
        })
    }

    pub fn is_file(&self, path: &str) -> Result<Task<bool>> {
        let path = NativePath::new(path)?;
        self.submit("is_file", move |driver, fs| {
            stat(driver, fs, &path).map(|info| info.is_file())
        })
    }

    /// A reader for `path`; nothing is opened until [`FileReader::open`].
    pub fn reader(&self, path: &str) -> Result<FileReader<D>> {
        let path = NativePath::new(path)?;
        Ok(FileReader::new(self.live()?, self.dispatcher.clone(), path))
    }

    /// A writer for `path`; nothing is opened until [`FileWriter::open`].
    pub fn writer(&self, path: &str, options: WriteOptions) -> Result<FileWriter<D>> {
        options.validate()?;
        let path = NativePath::new(path)?;
        Ok(FileWriter::new(
            self.live()?,
            self.dispatcher.clone(),
            path,
            options,
        ))
    }

    /// Close the session. New operations and file opens are refused at
    /// once; the native disconnect runs as soon as no task or open file
    /// still uses the handle.
    pub fn close(mut self) -> Task<()> {
        let Some(core) = self.core.take() else {
            return self.dispatcher.ready("disconnect", Ok(()));
        };
        core.mark_closed();
        let address = self.address.clone();
        self.dispatcher.run("disconnect", move || match Arc::try_unwrap(core) {
            Ok(mut core) => {
                let outcome = core.native.close();
                if outcome.is_ok() {
                    info!("disconnected from {address}");
                }
                outcome
            }
            Err(_) => {
                debug!("disconnect from {address} deferred until open files close");
                Ok(())
            }
        })
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.mark_closed();
            // The last reference may disconnect; keep that off this thread.
            self.dispatcher.detach("disconnect", move || drop(core));
        }
    }
}

fn stat<D: Driver>(driver: &D, fs: &D::Fs, path: &NativePath) -> Outcome<PathInfo> {
    let listing = check_handle(driver, driver.path_info(fs, path.as_c_str()))?;
    listing.first().map(PathInfo::from_raw).ok_or_else(|| {
        ErrorOutcome::new(
            libc::EIO,
            format!("no path info returned for {}", path.to_str_lossy()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::driver::memory::{MemoryCluster, MemoryDriver};

    fn session() -> Session<MemoryDriver> {
        let driver = MemoryDriver::new(MemoryCluster::builder().build());
        let dispatcher = Dispatcher::new(&DispatchConfig::default()).unwrap();
        Session::connect(driver, dispatcher, &ConnectOptions::default()).unwrap()
    }

    #[test]
    fn precondition_errors_are_synchronous() {
        let s = session();
        assert!(matches!(s.exists(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.chown("/", None, None), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.truncate("/f", -1), Err(Error::InvalidArgument(_))));
        assert!(matches!(s.set_replication("/f", 0), Err(Error::InvalidArgument(_))));
        assert_eq!(s.dispatcher().in_flight(), 0);
    }

    #[test]
    fn exists_reports_absence_as_false() {
        let s = session();
        assert!(s.exists("/").unwrap().wait().unwrap());
        assert!(!s.exists("/nowhere").unwrap().wait().unwrap());
    }

    #[test]
    fn working_directory_respects_buffer_size() {
        let s = session().with_max_path_length(4);
        let err = s.working_directory().unwrap().wait().unwrap_err();
        assert_eq!(err.code, libc::ERANGE);

        let s = session();
        s.create_directory("/tmp/work").unwrap().wait().unwrap();
        s.set_working_directory("/tmp/work").unwrap().wait().unwrap();
        assert_eq!(s.working_directory().unwrap().wait().unwrap(), "/tmp/work");
    }

    #[test]
    fn closed_session_refuses_new_work() {
        let s = session();
        let driver_cluster = s.core.as_ref().unwrap().native().unwrap().driver.cluster().clone();
        let reader = s.reader("/f").unwrap();
        s.close().wait().unwrap();
        // The reader still holds the handle, so the disconnect waits for it.
        assert_eq!(driver_cluster.connections(), 1);
        assert!(matches!(reader.open(), Err(Error::SessionClosed)));
        drop(reader);
        for _ in 0..100 {
            if driver_cluster.connections() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(driver_cluster.connections(), 0);
    }
}
