//! In-process namenode.
//!
//! `MemoryDriver` follows the conventions of the native library exactly:
//! integer status or `None` on failure, with the reason left in
//! thread-local state for [`Driver::last_error`]. It backs the test suite
//! and lets the CLI run without a cluster.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CStr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::debug;

use super::{AccessMode, ConnectParams, Driver, RawNamenode, RawPathInfo};
use crate::error::ErrorOutcome;

const ROOT: &str = "/";
const DIR_PERMISSIONS: i16 = 0o755;
const FILE_PERMISSIONS: i16 = 0o644;
const SUPERGROUP: &str = "supergroup";

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = const { RefCell::new((0, String::new())) };
}

struct Fault {
    code: i32,
    message: String,
}

impl Fault {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn not_found(path: &str) -> Self {
        Self::new(libc::ENOENT, format!("{path}: no such file or directory"))
    }

    fn record(self) {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = (self.code, self.message));
    }
}

type Fallible<T> = std::result::Result<T, Fault>;

fn status(result: Fallible<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(fault) => {
            fault.record();
            -1
        }
    }
}

fn value(result: Fallible<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(fault) => {
            fault.record();
            -1
        }
    }
}

fn handle<T>(result: Fallible<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(fault) => {
            fault.record();
            None
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn utf8(path: &CStr) -> Fallible<&str> {
    path.to_str()
        .map_err(|_| Fault::new(libc::EINVAL, "path is not valid UTF-8"))
}

/// Absolute, `.`/`..`-free form of `path`, relative paths taken from `cwd`.
/// A `hdfs://authority` prefix is accepted and dropped.
fn resolve(cwd: &str, path: &str) -> String {
    let path = match path.strip_prefix("hdfs://") {
        Some(rest) => rest.find('/').map_or(ROOT, |i| &rest[i..]),
        None => path,
    };
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => ROOT,
        Some((p, _)) => p,
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    dir == ROOT || path == dir || path.strip_prefix(dir).is_some_and(|r| r.starts_with('/'))
}

enum NodeKind {
    Directory,
    File { data: Vec<u8>, lease: Option<u64> },
}

struct Node {
    kind: NodeKind,
    owner: String,
    group: String,
    permissions: i16,
    replication: i16,
    block_size: i64,
    mtime: i64,
    atime: i64,
}

impl Node {
    fn directory(owner: &str) -> Self {
        let t = now();
        Self {
            kind: NodeKind::Directory,
            owner: owner.to_string(),
            group: SUPERGROUP.to_string(),
            permissions: DIR_PERMISSIONS,
            replication: 0,
            block_size: 0,
            mtime: t,
            atime: t,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    fn size(&self) -> i64 {
        match &self.kind {
            NodeKind::File { data, .. } => data.len() as i64,
            NodeKind::Directory => 0,
        }
    }

    fn entry(&self, name: String) -> MemoryEntry {
        MemoryEntry {
            kind: if self.is_dir() { b'D' } else { b'F' },
            name,
            size: self.size(),
            replication: self.replication,
            block_size: self.block_size,
            owner: self.owner.clone(),
            group: self.group.clone(),
            permissions: self.permissions,
            last_mod: self.mtime,
            last_access: self.atime,
        }
    }
}

struct Namespace {
    nodes: BTreeMap<String, Node>,
}

impl Namespace {
    fn new(owner: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Node::directory(owner));
        Self { nodes }
    }

    fn get(&self, path: &str) -> Fallible<&Node> {
        self.nodes.get(path).ok_or_else(|| Fault::not_found(path))
    }

    fn get_mut(&mut self, path: &str) -> Fallible<&mut Node> {
        self.nodes.get_mut(path).ok_or_else(|| Fault::not_found(path))
    }

    fn file_mut(&mut self, path: &str) -> Fallible<&mut Node> {
        let node = self.get_mut(path)?;
        if node.is_dir() {
            return Err(Fault::new(libc::EISDIR, format!("{path}: is a directory")));
        }
        Ok(node)
    }

    fn subtree(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|k| is_within(k, dir))
            .cloned()
            .collect()
    }

    fn children(&self, dir: &str) -> impl Iterator<Item = (&String, &Node)> {
        let prefix = if dir == ROOT {
            ROOT.to_string()
        } else {
            format!("{dir}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| {
                let rest = &k[if dir == ROOT { 1 } else { dir.len() + 1 }..];
                !rest.is_empty() && !rest.contains('/')
            })
    }

    /// `mkdir -p`; an existing directory is not an error.
    fn make_dirs(&mut self, path: &str, owner: &str) -> Fallible<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.nodes.get(&current) {
                Some(node) if node.is_dir() => {}
                Some(_) if current == path => {
                    return Err(Fault::new(libc::EEXIST, format!("{path}: file exists")));
                }
                Some(_) => {
                    return Err(Fault::new(
                        libc::ENOTDIR,
                        format!("{current}: not a directory"),
                    ));
                }
                None => {
                    self.nodes.insert(current.clone(), Node::directory(owner));
                }
            }
        }
        Ok(())
    }

    fn used(&self) -> i64 {
        self.nodes.values().map(Node::size).sum()
    }
}

/// Connected-filesystem handle of the memory driver.
pub struct MemoryFs {
    id: u64,
    user: String,
    cwd: Mutex<String>,
}

impl MemoryFs {
    fn cwd(&self) -> String {
        self.cwd.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn resolve(&self, path: &CStr) -> Fallible<String> {
        Ok(resolve(&self.cwd(), utf8(path)?))
    }
}

/// Open-file handle of the memory driver.
pub struct MemoryFile {
    id: u64,
    path: String,
    mode: AccessMode,
    position: AtomicU64,
}

pub struct MemoryEntry {
    kind: u8,
    name: String,
    size: i64,
    replication: i16,
    block_size: i64,
    owner: String,
    group: String,
    permissions: i16,
    last_mod: i64,
    last_access: i64,
}

impl RawPathInfo for MemoryEntry {
    fn kind(&self) -> u8 {
        self.kind
    }
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
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
        Cow::Borrowed(&self.owner)
    }
    fn group(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.group)
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

/// Entry array handed out by listing calls; counted until dropped.
pub struct MemoryListing {
    entries: Vec<MemoryEntry>,
    live: Arc<AtomicUsize>,
}

impl MemoryListing {
    fn new(entries: Vec<MemoryEntry>, live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            entries,
            live: live.clone(),
        }
    }
}

impl Deref for MemoryListing {
    type Target = [MemoryEntry];

    fn deref(&self) -> &[MemoryEntry] {
        &self.entries
    }
}

impl Drop for MemoryListing {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryNamenode {
    rpc_address: String,
    http_address: String,
}

impl RawNamenode for MemoryNamenode {
    fn rpc_address(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.rpc_address)
    }
    fn http_address(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.http_address)
    }
}

#[derive(Default)]
struct Gates {
    held: HashSet<&'static str>,
}

pub struct MemoryClusterBuilder {
    host: String,
    port: u16,
    capacity: i64,
    block_size: i64,
    replication: i16,
    default_user: String,
    token: Option<String>,
    ha: HashMap<String, Vec<(String, String)>>,
}

impl Default for MemoryClusterBuilder {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8020,
            capacity: 1 << 40,
            block_size: 128 << 20,
            replication: 3,
            default_user: "hdfs".into(),
            token: None,
            ha: HashMap::new(),
        }
    }
}

impl MemoryClusterBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn block_size(mut self, block_size: i64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn replication(mut self, replication: i16) -> Self {
        self.replication = replication;
        self
    }

    /// Identity used when a connect call names no user.
    pub fn default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    /// Refuse connections that do not present this delegation token.
    pub fn require_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Register an HA nameservice with `(rpc, http)` address pairs.
    pub fn ha_service(mut self, service: impl Into<String>, namenodes: &[(&str, &str)]) -> Self {
        self.ha.insert(
            service.into(),
            namenodes
                .iter()
                .map(|(rpc, http)| (rpc.to_string(), http.to_string()))
                .collect(),
        );
        self
    }

    pub fn build(self) -> Arc<MemoryCluster> {
        Arc::new(MemoryCluster {
            namespace: Mutex::new(Namespace::new(&self.default_user)),
            host: self.host,
            port: self.port,
            capacity: self.capacity,
            block_size: self.block_size,
            replication: self.replication,
            default_user: self.default_user,
            token: self.token,
            ha: self.ha,
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            gates: Mutex::new(Gates::default()),
            gate_changed: Condvar::new(),
            next_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            open_files: AtomicUsize::new(0),
            live_listings: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
            last_thread: Mutex::new(None),
        })
    }
}

/// Shared state of a simulated cluster. Several drivers, and so several
/// sessions, may point at the same cluster.
pub struct MemoryCluster {
    namespace: Mutex<Namespace>,
    host: String,
    port: u16,
    capacity: i64,
    block_size: i64,
    replication: i16,
    default_user: String,
    token: Option<String>,
    ha: HashMap<String, Vec<(String, String)>>,
    faults: Mutex<HashMap<&'static str, i32>>,
    latency: Mutex<Duration>,
    gates: Mutex<Gates>,
    gate_changed: Condvar,
    next_id: AtomicU64,
    connections: AtomicUsize,
    open_files: AtomicUsize,
    live_listings: Arc<AtomicUsize>,
    calls: AtomicUsize,
    last_thread: Mutex<Option<ThreadId>>,
}

impl MemoryCluster {
    pub fn builder() -> MemoryClusterBuilder {
        MemoryClusterBuilder::default()
    }

    /// Make the next call of `op` (a `Driver` method name) fail with `code`.
    pub fn fail_next(&self, op: &'static str, code: i32) {
        lock(&self.faults).insert(op, code);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Park every call of `op` until [`MemoryCluster::release`] is called.
    pub fn hold(&self, op: &'static str) {
        lock(&self.gates).held.insert(op);
    }

    pub fn release(&self, op: &'static str) {
        lock(&self.gates).held.remove(op);
        self.gate_changed.notify_all();
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }

    /// Listings handed out and not yet dropped.
    pub fn live_listings(&self) -> usize {
        self.live_listings.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Thread that executed the most recent call.
    pub fn last_thread(&self) -> Option<ThreadId> {
        *lock(&self.last_thread)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn namespace(&self) -> MutexGuard<'_, Namespace> {
        lock(&self.namespace)
    }

    fn enter(&self, op: &'static str) -> Fallible<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_thread) = Some(thread::current().id());

        let mut gates = lock(&self.gates);
        while gates.held.contains(op) {
            gates = self
                .gate_changed
                .wait(gates)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(gates);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        match lock(&self.faults).remove(op) {
            Some(code) => Err(Fault::new(code, format!("injected failure in {op}"))),
            None => Ok(()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct MemoryDriver {
    cluster: Arc<MemoryCluster>,
}

impl MemoryDriver {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    fn call<T>(
        &self,
        op: &'static str,
        body: impl FnOnce(&MemoryCluster) -> Fallible<T>,
    ) -> Fallible<T> {
        self.cluster.enter(op)?;
        body(&self.cluster)
    }

    fn on_path(
        &self,
        op: &'static str,
        fs: &MemoryFs,
        path: &CStr,
        body: impl FnOnce(&mut Namespace, &str) -> Fallible<()>,
    ) -> i32 {
        status(self.call(op, |c| {
            let path = fs.resolve(path)?;
            body(&mut c.namespace(), &path)
        }))
    }

    fn check_connect(&self, params: &ConnectParams) -> Fallible<MemoryFs> {
        let c = &self.cluster;
        let host = params.host.to_string_lossy();
        let host_ok = host == "default" || host == c.host.as_str();
        let port_ok = params.port == 0 || params.port == c.port;
        if !host_ok || !port_ok {
            return Err(Fault::new(
                libc::ECONNREFUSED,
                format!("connection refused: {}", params.address()),
            ));
        }
        if let Some(expected) = &c.token {
            let presented = params.auth_token.as_ref().map(|t| t.to_string_lossy());
            if presented.as_deref() != Some(expected.as_str()) {
                return Err(Fault::new(libc::EACCES, "delegation token rejected"));
            }
        }
        let user = params
            .user
            .as_ref()
            .map(|u| u.to_string_lossy().into_owned())
            .unwrap_or_else(|| c.default_user.clone());
        let cwd = format!("/user/{user}");
        Ok(MemoryFs {
            id: c.next_id(),
            user,
            cwd: Mutex::new(cwd),
        })
    }
}

impl Driver for MemoryDriver {
    type Fs = MemoryFs;
    type File = MemoryFile;
    type Entry = MemoryEntry;
    type Listing = MemoryListing;
    type Namenode = MemoryNamenode;
    type Namenodes = Vec<MemoryNamenode>;

    fn last_error(&self) -> ErrorOutcome {
        LAST_ERROR.with(|slot| {
            let slot = slot.borrow();
            let (code, message) = &*slot;
            ErrorOutcome::new(if *code == 0 { libc::EIO } else { *code }, message.clone())
        })
    }

    fn connect(&self, params: &ConnectParams) -> Option<MemoryFs> {
        let fs = handle(self.call("connect", |_| self.check_connect(params)))?;
        self.cluster.connections.fetch_add(1, Ordering::SeqCst);
        debug!("memory fs {} connected as {}", fs.id, fs.user);
        Some(fs)
    }

    fn disconnect(&self, fs: MemoryFs) -> i32 {
        let rc = status(self.call("disconnect", |_| Ok(())));
        self.cluster.connections.fetch_sub(1, Ordering::SeqCst);
        debug!("memory fs {} disconnected", fs.id);
        rc
    }

    fn exists(&self, fs: &MemoryFs, path: &CStr) -> i32 {
        self.on_path("exists", fs, path, |ns, path| ns.get(path).map(|_| ()))
    }

    fn rename(&self, fs: &MemoryFs, from: &CStr, to: &CStr) -> i32 {
        status(self.call("rename", |c| {
            let from = fs.resolve(from)?;
            let to = fs.resolve(to)?;
            let mut ns = c.namespace();
            ns.get(&from)?;
            if from == ROOT || is_within(&to, &from) {
                return Err(Fault::new(
                    libc::EINVAL,
                    format!("cannot rename {from} to {to}"),
                ));
            }
            if ns.nodes.contains_key(&to) {
                return Err(Fault::new(libc::EEXIST, format!("{to}: file exists")));
            }
            let target_parent = parent(&to);
            if !ns.get(target_parent)?.is_dir() {
                return Err(Fault::new(
                    libc::ENOTDIR,
                    format!("{target_parent}: not a directory"),
                ));
            }
            for key in ns.subtree(&from) {
                if let Some(node) = ns.nodes.remove(&key) {
                    let moved = format!("{to}{}", &key[from.len()..]);
                    ns.nodes.insert(moved, node);
                }
            }
            Ok(())
        }))
    }

    fn create_directory(&self, fs: &MemoryFs, path: &CStr) -> i32 {
        self.on_path("create_directory", fs, path, |ns, path| {
            ns.make_dirs(path, &fs.user)
        })
    }

    fn delete(&self, fs: &MemoryFs, path: &CStr, recursive: bool) -> i32 {
        self.on_path("delete", fs, path, |ns, path| {
            if path == ROOT {
                return Err(Fault::new(libc::EPERM, "refusing to delete the root"));
            }
            if ns.get(path)?.is_dir() && !recursive && ns.children(path).next().is_some() {
                return Err(Fault::new(
                    libc::ENOTEMPTY,
                    format!("{path}: directory not empty"),
                ));
            }
            for key in ns.subtree(path) {
                ns.nodes.remove(&key);
            }
            Ok(())
        })
    }

    fn set_replication(&self, fs: &MemoryFs, path: &CStr, replication: i16) -> i32 {
        self.on_path("set_replication", fs, path, |ns, path| {
            if replication <= 0 {
                return Err(Fault::new(
                    libc::EINVAL,
                    format!("invalid replication {replication}"),
                ));
            }
            ns.file_mut(path)?.replication = replication;
            Ok(())
        })
    }

    fn chown(
        &self,
        fs: &MemoryFs,
        path: &CStr,
        owner: Option<&CStr>,
        group: Option<&CStr>,
    ) -> i32 {
        self.on_path("chown", fs, path, |ns, path| {
            if owner.is_none() && group.is_none() {
                return Err(Fault::new(libc::EINVAL, "owner and group are both unset"));
            }
            let node = ns.get_mut(path)?;
            if let Some(owner) = owner {
                node.owner = owner.to_string_lossy().into_owned();
            }
            if let Some(group) = group {
                node.group = group.to_string_lossy().into_owned();
            }
            Ok(())
        })
    }

    fn chmod(&self, fs: &MemoryFs, path: &CStr, mode: i16) -> i32 {
        self.on_path("chmod", fs, path, |ns, path| {
            ns.get_mut(path)?.permissions = mode & 0o7777;
            Ok(())
        })
    }

    fn utime(&self, fs: &MemoryFs, path: &CStr, mtime: i64, atime: i64) -> i32 {
        self.on_path("utime", fs, path, |ns, path| {
            let node = ns.get_mut(path)?;
            if mtime != -1 {
                node.mtime = mtime;
            }
            if atime != -1 {
                node.atime = atime;
            }
            Ok(())
        })
    }

    fn truncate(&self, fs: &MemoryFs, path: &CStr, pos: i64, should_wait: &mut i32) -> i32 {
        self.on_path("truncate", fs, path, |ns, path| {
            let node = ns.file_mut(path)?;
            let block_size = node.block_size.max(1);
            let NodeKind::File { data, lease } = &mut node.kind else {
                return Err(Fault::new(libc::EISDIR, format!("{path}: is a directory")));
            };
            if lease.is_some() {
                return Err(Fault::new(libc::EBUSY, format!("{path}: file is being written")));
            }
            if pos < 0 || pos as usize > data.len() {
                return Err(Fault::new(
                    libc::EINVAL,
                    format!("{path}: cannot truncate to {pos}, length is {}", data.len()),
                ));
            }
            data.truncate(pos as usize);
            node.mtime = now();
            *should_wait = i32::from(pos % block_size != 0);
            Ok(())
        })
    }

    fn working_directory(&self, fs: &MemoryFs, buf: &mut [u8]) -> Option<usize> {
        handle(self.call("working_directory", |_| {
            let cwd = fs.cwd();
            let bytes = cwd.as_bytes();
            if bytes.len() + 1 > buf.len() {
                return Err(Fault::new(
                    libc::ERANGE,
                    format!("working directory does not fit in {} bytes", buf.len()),
                ));
            }
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
            Ok(bytes.len())
        }))
    }

    fn set_working_directory(&self, fs: &MemoryFs, path: &CStr) -> i32 {
        self.on_path("set_working_directory", fs, path, |ns, path| {
            if !ns.get(path)?.is_dir() {
                return Err(Fault::new(libc::ENOTDIR, format!("{path}: not a directory")));
            }
            *lock(&fs.cwd) = path.to_string();
            Ok(())
        })
    }

    fn default_block_size(&self, _fs: &MemoryFs) -> i64 {
        value(self.call("default_block_size", |c| Ok(c.block_size)))
    }

    fn capacity(&self, _fs: &MemoryFs) -> i64 {
        value(self.call("capacity", |c| Ok(c.capacity)))
    }

    fn used(&self, _fs: &MemoryFs) -> i64 {
        value(self.call("used", |c| Ok(c.namespace().used())))
    }

    fn list_directory(&self, fs: &MemoryFs, path: &CStr) -> Option<MemoryListing> {
        handle(self.call("list_directory", |c| {
            let path = fs.resolve(path)?;
            let ns = c.namespace();
            let node = ns.get(&path)?;
            let entries = if node.is_dir() {
                ns.children(&path)
                    .map(|(key, child)| {
                        let name = key.rsplit('/').next().unwrap_or_default();
                        // Joined naively, the way the native client reports
                        // children of the root.
                        child.entry(format!("{path}/{name}"))
                    })
                    .collect()
            } else {
                vec![node.entry(path.clone())]
            };
            Ok(MemoryListing::new(entries, &c.live_listings))
        }))
    }

    fn path_info(&self, fs: &MemoryFs, path: &CStr) -> Option<MemoryListing> {
        handle(self.call("path_info", |c| {
            let path = fs.resolve(path)?;
            let ns = c.namespace();
            let entry = ns.get(&path)?.entry(path.clone());
            Ok(MemoryListing::new(vec![entry], &c.live_listings))
        }))
    }

    fn open_file(
        &self,
        fs: &MemoryFs,
        path: &CStr,
        mode: AccessMode,
        buffer_size: i32,
        replication: i16,
        block_size: i64,
    ) -> Option<MemoryFile> {
        let file = handle(self.call("open_file", |c| {
            if buffer_size < 0 || replication < 0 || block_size < 0 {
                return Err(Fault::new(libc::EINVAL, "negative open parameter"));
            }
            let path = fs.resolve(path)?;
            let id = c.next_id();
            let mut ns = c.namespace();
            let position = match mode {
                AccessMode::ReadOnly => {
                    let node = ns.file_mut(&path)?;
                    node.atime = now();
                    0
                }
                AccessMode::WriteOnly => {
                    if let Some(node) = ns.nodes.get(&path) {
                        match &node.kind {
                            NodeKind::Directory => {
                                return Err(Fault::new(
                                    libc::EISDIR,
                                    format!("{path}: is a directory"),
                                ));
                            }
                            NodeKind::File { lease: Some(_), .. } => {
                                return Err(Fault::new(
                                    libc::EBUSY,
                                    format!("{path}: lease is held by another writer"),
                                ));
                            }
                            NodeKind::File { .. } => {}
                        }
                    }
                    ns.make_dirs(parent(&path), &fs.user)?;
                    let t = now();
                    ns.nodes.insert(
                        path.clone(),
                        Node {
                            kind: NodeKind::File {
                                data: Vec::new(),
                                lease: Some(id),
                            },
                            owner: fs.user.clone(),
                            group: SUPERGROUP.to_string(),
                            permissions: FILE_PERMISSIONS,
                            replication: if replication > 0 { replication } else { c.replication },
                            block_size: if block_size > 0 { block_size } else { c.block_size },
                            mtime: t,
                            atime: t,
                        },
                    );
                    0
                }
                AccessMode::Append => {
                    let node = ns.file_mut(&path)?;
                    let NodeKind::File { data, lease } = &mut node.kind else {
                        return Err(Fault::new(libc::EISDIR, format!("{path}: is a directory")));
                    };
                    if lease.is_some() {
                        return Err(Fault::new(
                            libc::EBUSY,
                            format!("{path}: lease is held by another writer"),
                        ));
                    }
                    *lease = Some(id);
                    data.len() as u64
                }
            };
            Ok(MemoryFile {
                id,
                path,
                mode,
                position: AtomicU64::new(position),
            })
        }))?;
        self.cluster.open_files.fetch_add(1, Ordering::SeqCst);
        Some(file)
    }

    fn close_file(&self, _fs: &MemoryFs, file: MemoryFile) -> i32 {
        let rc = status(self.call("close_file", |c| {
            if file.mode.is_write() {
                let mut ns = c.namespace();
                if let Some(Node {
                    kind: NodeKind::File { lease, .. },
                    ..
                }) = ns.nodes.get_mut(&file.path)
                {
                    if *lease == Some(file.id) {
                        *lease = None;
                    }
                }
            }
            Ok(())
        }));
        self.cluster.open_files.fetch_sub(1, Ordering::SeqCst);
        rc
    }

    fn read(&self, _fs: &MemoryFs, file: &MemoryFile, buf: &mut [u8]) -> i32 {
        let n = value(self.call("read", |c| {
            if file.mode.is_write() {
                return Err(Fault::new(libc::EBADF, format!("{}: not open for reading", file.path)));
            }
            let ns = c.namespace();
            let NodeKind::File { data, .. } = &ns.get(&file.path)?.kind else {
                return Err(Fault::new(libc::EISDIR, format!("{}: is a directory", file.path)));
            };
            let start = (file.position.load(Ordering::SeqCst) as usize).min(data.len());
            let n = (data.len() - start).min(buf.len()).min(i32::MAX as usize);
            buf[..n].copy_from_slice(&data[start..start + n]);
            file.position.fetch_add(n as u64, Ordering::SeqCst);
            Ok(n as i64)
        }));
        n as i32
    }

    fn write(&self, _fs: &MemoryFs, file: &MemoryFile, buf: &[u8]) -> i32 {
        let n = value(self.call("write", |c| {
            if !file.mode.is_write() {
                return Err(Fault::new(libc::EBADF, format!("{}: not open for writing", file.path)));
            }
            let mut ns = c.namespace();
            let node = ns.file_mut(&file.path)?;
            let NodeKind::File { data, lease } = &mut node.kind else {
                return Err(Fault::new(libc::EISDIR, format!("{}: is a directory", file.path)));
            };
            if *lease != Some(file.id) {
                return Err(Fault::new(libc::EBADF, format!("{}: lease lost", file.path)));
            }
            let n = buf.len().min(i32::MAX as usize);
            data.extend_from_slice(&buf[..n]);
            node.mtime = now();
            file.position.fetch_add(n as u64, Ordering::SeqCst);
            Ok(n as i64)
        }));
        n as i32
    }

    fn flush(&self, _fs: &MemoryFs, file: &MemoryFile) -> i32 {
        status(self.call("flush", |_| writable(file)))
    }

    fn hflush(&self, _fs: &MemoryFs, file: &MemoryFile) -> i32 {
        status(self.call("hflush", |_| writable(file)))
    }

    fn sync(&self, _fs: &MemoryFs, file: &MemoryFile) -> i32 {
        status(self.call("sync", |_| writable(file)))
    }

    fn ha_namenodes(&self, service: &CStr) -> Option<Vec<MemoryNamenode>> {
        handle(self.call("ha_namenodes", |c| {
            let service = utf8(service)?;
            let pairs = c.ha.get(service).ok_or_else(|| {
                Fault::new(
                    libc::EINVAL,
                    format!("no HA namenodes configured for nameservice {service}"),
                )
            })?;
            Ok(pairs
                .iter()
                .map(|(rpc, http)| MemoryNamenode {
                    rpc_address: rpc.clone(),
                    http_address: http.clone(),
                })
                .collect())
        }))
    }
}

fn writable(file: &MemoryFile) -> Fallible<()> {
    if file.mode.is_write() {
        Ok(())
    } else {
        Err(Fault::new(libc::EBADF, format!("{}: not open for writing", file.path)))
    }
}
