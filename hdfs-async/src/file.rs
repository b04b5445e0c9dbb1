//! File handles.
//!
//! A handle moves through `Created → Opening → Open → Closing → Closed`.
//! Transfers clone a shared reference to the open native file, so a close
//! issued while a transfer is still running only releases the native file
//! once that transfer has finished.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::capture::{check_handle, check_status};
use crate::dispatch::{Dispatcher, Task};
use crate::driver::{AccessMode, Driver, NativePath};
use crate::error::{Error, ErrorOutcome, Outcome, Result};
use crate::resource::{Release, Resource};
use crate::session::SessionCore;

/// Observable lifecycle position of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

/// How a writer opens its file. Zero means "library default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub replication: i16,
    pub block_size: i64,
    pub buffer_size: i32,
    /// Append to an existing file instead of replacing it.
    pub append: bool,
}

impl WriteOptions {
    pub fn replication(mut self, replication: i16) -> Self {
        self.replication = replication;
        self
    }

    pub fn block_size(mut self, block_size: i64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn buffer_size(mut self, buffer_size: i32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.replication < 0 || self.block_size < 0 || self.buffer_size < 0 {
            return Err(Error::InvalidArgument(format!(
                "write options must not be negative: {self:?}"
            )));
        }
        Ok(())
    }

    fn mode(&self) -> AccessMode {
        if self.append {
            AccessMode::Append
        } else {
            AccessMode::WriteOnly
        }
    }
}

pub(crate) struct NativeFile<D: Driver> {
    session: Arc<SessionCore<D>>,
    file: D::File,
}

impl<D: Driver> Release for NativeFile<D> {
    const KIND: &'static str = "file";

    fn release(self) -> Outcome<()> {
        let native = self.session.native()?;
        let rc = native.driver.close_file(&native.fs, self.file);
        check_status(&native.driver, rc).map(drop)
    }
}

type OpenFile<D> = Arc<Resource<NativeFile<D>>>;

enum FileState<D: Driver> {
    Created,
    Opening,
    Open(OpenFile<D>),
    Closing,
    Closed,
}

impl<D: Driver> FileState<D> {
    fn public(&self) -> HandleState {
        match self {
            FileState::Created => HandleState::Created,
            FileState::Opening => HandleState::Opening,
            FileState::Open(_) => HandleState::Open,
            FileState::Closing => HandleState::Closing,
            FileState::Closed => HandleState::Closed,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FileHandle<D: Driver> {
    // Only `None` once the handle is being dropped.
    session: Option<Arc<SessionCore<D>>>,
    dispatcher: Dispatcher,
    path: NativePath,
    state: Arc<Mutex<FileState<D>>>,
}

impl<D: Driver> FileHandle<D> {
    fn new(session: Arc<SessionCore<D>>, dispatcher: Dispatcher, path: NativePath) -> Self {
        Self {
            session: Some(session),
            dispatcher,
            path,
            state: Arc::new(Mutex::new(FileState::Created)),
        }
    }

    fn path_string(&self) -> String {
        self.path.to_str_lossy().into_owned()
    }

    fn state(&self) -> HandleState {
        lock(&self.state).public()
    }

    fn open(&self, mode: AccessMode, options: WriteOptions) -> Result<Task<()>> {
        let session = match &self.session {
            Some(session) if !session.is_closed() => session.clone(),
            _ => return Err(Error::SessionClosed),
        };
        {
            let mut state = lock(&self.state);
            match &*state {
                FileState::Created => {}
                FileState::Closed => return Err(Error::Closed { path: self.path_string() }),
                _ => return Err(Error::AlreadyOpen { path: self.path_string() }),
            }
            *state = FileState::Opening;
        }
        let state = self.state.clone();
        let path = self.path.clone();
        Ok(self.dispatcher.run("open", move || {
            let opened = session.native().and_then(|native| {
                let file = native.driver.open_file(
                    &native.fs,
                    path.as_c_str(),
                    mode,
                    options.buffer_size,
                    options.replication,
                    options.block_size,
                );
                check_handle(&native.driver, file)
            });
            let mut state = lock(&state);
            match opened {
                Ok(file) => {
                    let label = path.to_str_lossy().into_owned();
                    *state = FileState::Open(Arc::new(Resource::new(
                        NativeFile { session, file },
                        label,
                    )));
                    Ok(())
                }
                Err(e) => {
                    *state = FileState::Created;
                    Err(e)
                }
            }
        }))
    }

    fn open_file(&self) -> Result<OpenFile<D>> {
        match &*lock(&self.state) {
            FileState::Open(file) => Ok(file.clone()),
            FileState::Closed => Err(Error::Closed { path: self.path_string() }),
            _ => Err(Error::NotOpen { path: self.path_string() }),
        }
    }

    /// Run one blocking call against the open native file.
    fn transfer<T, F>(&self, op: &'static str, call: F) -> Result<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce(&D, &D::Fs, &D::File) -> Outcome<T> + Send + 'static,
    {
        let file = self.open_file()?;
        Ok(self.dispatcher.run(op, move || {
            let native = file
                .get()
                .ok_or_else(|| ErrorOutcome::bad_handle(file.label()))?;
            let fs = native.session.native()?;
            call(&fs.driver, &fs.fs, &native.file)
        }))
    }

    fn close(&self) -> Task<()> {
        let file = {
            let mut state = lock(&self.state);
            if !matches!(*state, FileState::Open(_)) {
                return self.dispatcher.ready("close", Ok(()));
            }
            match mem::replace(&mut *state, FileState::Closing) {
                FileState::Open(file) => file,
                _ => return self.dispatcher.ready("close", Ok(())),
            }
        };
        let state = self.state.clone();
        self.dispatcher.run("close", move || {
            let outcome = match Arc::try_unwrap(file) {
                Ok(mut file) => file.close(),
                Err(shared) => {
                    debug!("close of {} deferred until transfers finish", shared.label());
                    Ok(())
                }
            };
            *lock(&state) = FileState::Closed;
            outcome
        })
    }
}

impl<D: Driver> Drop for FileHandle<D> {
    fn drop(&mut self) {
        let state = mem::replace(&mut *lock(&self.state), FileState::Closed);
        // Either reference may be the last one keeping the connection up.
        let session = self.session.take();
        self.dispatcher.detach("close", move || {
            drop(state);
            drop(session);
        });
    }
}

/// Read side of a file.
pub struct FileReader<D: Driver> {
    handle: FileHandle<D>,
}

impl<D: Driver> FileReader<D> {
    pub(crate) fn new(
        session: Arc<SessionCore<D>>,
        dispatcher: Dispatcher,
        path: NativePath,
    ) -> Self {
        Self {
            handle: FileHandle::new(session, dispatcher, path),
        }
    }

    pub fn path(&self) -> String {
        self.handle.path_string()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    pub fn open(&self) -> Result<Task<()>> {
        self.handle.open(AccessMode::ReadOnly, WriteOptions::default())
    }

    /// Up to `len` bytes from the current position; empty at end of file.
    pub fn read(&self, len: usize) -> Result<Task<Bytes>> {
        if len == 0 {
            return Err(Error::InvalidArgument("read length must be positive".into()));
        }
        self.handle.transfer("read", move |driver, fs, file| {
            let mut buf = BytesMut::zeroed(len.min(i32::MAX as usize));
            let n = check_status(driver, driver.read(fs, file, &mut buf))?;
            buf.truncate(n as usize);
            Ok(buf.freeze())
        })
    }

    /// Idempotent: a second call, or a call on an unopened reader, is a
    /// no-op success.
    pub fn close(&self) -> Task<()> {
        self.handle.close()
    }
}

/// Write side of a file.
pub struct FileWriter<D: Driver> {
    handle: FileHandle<D>,
    options: WriteOptions,
}

impl<D: Driver> FileWriter<D> {
    pub(crate) fn new(
        session: Arc<SessionCore<D>>,
        dispatcher: Dispatcher,
        path: NativePath,
        options: WriteOptions,
    ) -> Self {
        Self {
            handle: FileHandle::new(session, dispatcher, path),
            options,
        }
    }

    pub fn path(&self) -> String {
        self.handle.path_string()
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    pub fn open(&self) -> Result<Task<()>> {
        self.handle.open(self.options.mode(), self.options)
    }

    /// Bytes accepted by the library, which may be fewer than `data.len()`.
    pub fn write(&self, data: Bytes) -> Result<Task<usize>> {
        self.handle.transfer("write", move |driver, fs, file| {
            let n = check_status(driver, driver.write(fs, file, &data))?;
            Ok(n as usize)
        })
    }

    /// Flush client-side buffers.
    pub fn flush(&self) -> Result<Task<()>> {
        self.handle.transfer("flush", |driver, fs, file| {
            check_status(driver, driver.flush(fs, file)).map(drop)
        })
    }

    /// Flush to every datanode in the pipeline so new readers see the data.
    pub fn hflush(&self) -> Result<Task<()>> {
        self.handle.transfer("hflush", |driver, fs, file| {
            check_status(driver, driver.hflush(fs, file)).map(drop)
        })
    }

    /// Flush and persist on the datanodes.
    pub fn sync(&self) -> Result<Task<()>> {
        self.handle.transfer("sync", |driver, fs, file| {
            check_status(driver, driver.sync(fs, file)).map(drop)
        })
    }

    pub fn close(&self) -> Task<()> {
        self.handle.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectOptions;
    use crate::config::DispatchConfig;
    use crate::driver::memory::{MemoryCluster, MemoryDriver};
    use crate::session::Session;

    fn session() -> (Session<MemoryDriver>, Arc<MemoryCluster>) {
        let cluster = MemoryCluster::builder().build();
        let driver = MemoryDriver::new(cluster.clone());
        let dispatcher = Dispatcher::new(&DispatchConfig::default()).unwrap();
        let session = Session::connect(driver, dispatcher, &ConnectOptions::default()).unwrap();
        (session, cluster)
    }

    #[test]
    fn transfers_need_an_open_handle() {
        let (s, _) = session();
        let r = s.reader("/f").unwrap();
        assert!(matches!(r.read(4), Err(Error::NotOpen { .. })));
        assert!(matches!(r.read(0), Err(Error::InvalidArgument(_))));
        assert_eq!(r.state(), HandleState::Created);
    }

    #[test]
    fn failed_open_returns_to_created() {
        let (s, _) = session();
        let r = s.reader("/missing").unwrap();
        let err = r.open().unwrap().wait().unwrap_err();
        assert_eq!(err.code, libc::ENOENT);
        assert_eq!(r.state(), HandleState::Created);
    }

    #[test]
    fn close_before_open_is_a_noop() {
        let (s, _) = session();
        let w = s.writer("/f", WriteOptions::default()).unwrap();
        assert!(w.close().wait().is_ok());
        assert_eq!(w.state(), HandleState::Created);
    }

    #[test]
    fn reopen_is_refused() {
        let (s, _) = session();
        let w = s.writer("/f", WriteOptions::default()).unwrap();
        w.open().unwrap().wait().unwrap();
        assert!(matches!(w.open(), Err(Error::AlreadyOpen { .. })));
        w.close().wait().unwrap();
        assert!(matches!(w.open(), Err(Error::Closed { .. })));
    }

    #[test]
    fn close_waits_for_running_transfer() {
        let (s, cluster) = session();
        let w = s.writer("/slow", WriteOptions::default()).unwrap();
        w.open().unwrap().wait().unwrap();

        cluster.hold("write");
        let write = w.write(Bytes::from_static(b"abc")).unwrap();
        w.close().wait().unwrap();
        assert_eq!(w.state(), HandleState::Closed);
        assert_eq!(cluster.open_files(), 1);

        cluster.release("write");
        assert_eq!(write.wait().unwrap(), 3);
        // The transfer held the last reference.
        assert_eq!(cluster.open_files(), 0);
    }

    #[test]
    fn drop_closes_in_the_background() {
        let (s, cluster) = session();
        let w = s.writer("/dropped", WriteOptions::default()).unwrap();
        w.open().unwrap().wait().unwrap();
        assert_eq!(cluster.open_files(), 1);
        drop(w);
        for _ in 0..100 {
            if cluster.open_files() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(cluster.open_files(), 0);
        // The lease was released, so the file can be written again.
        let w = s.writer("/dropped", WriteOptions::default().append(true)).unwrap();
        assert!(w.open().unwrap().wait().is_ok());
    }

    #[test]
    fn last_handle_drop_disconnects_on_a_worker() {
        let (s, cluster) = session();
        let r = s.reader("/f").unwrap();
        s.close().wait().unwrap();
        assert_eq!(cluster.connections(), 1);

        let latency = std::time::Duration::from_millis(300);
        cluster.set_latency(latency);
        let started = std::time::Instant::now();
        drop(r);
        assert!(started.elapsed() < latency);

        for _ in 0..100 {
            if cluster.connections() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(cluster.connections(), 0);
        assert_ne!(cluster.last_thread(), Some(std::thread::current().id()));
    }

    #[test]
    fn negative_write_options_are_rejected() {
        let (s, _) = session();
        let opts = WriteOptions::default().replication(-1);
        assert!(matches!(s.writer("/f", opts), Err(Error::InvalidArgument(_))));
    }
}
