//! Async client layer over the blocking libhdfs3 API.
//!
//! Every native call runs on a worker thread and each native handle has a
//! single owner. Failures are captured on the thread where they happen.

pub mod capture;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod file;
pub mod meta;
pub mod resource;
pub mod session;
pub mod stream;

pub use cluster::ClusterInfo;
pub use config::{ClientConfig, ConnectOptions, DispatchConfig, load_config};
pub use dispatch::{Dispatcher, Task};
pub use error::{Error, ErrorOutcome, Outcome, Result};
pub use file::{FileReader, FileWriter, HandleState, WriteOptions};
pub use meta::{EntryKind, NamenodeInfo, PathInfo};
pub use session::{Session, Truncation};
