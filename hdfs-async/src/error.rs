use std::io;

use thiserror::Error;

/// A native failure captured on the worker thread that observed it.
///
/// `code` is the errno value the library left behind, `message` the text
/// returned by the library's last-error accessor at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (errno {code})")]
pub struct ErrorOutcome {
    pub code: i32,
    pub message: String,
}

impl ErrorOutcome {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = io::Error::from_raw_os_error(code).to_string();
        }
        Self { code, message }
    }

    pub(crate) fn bad_handle(what: &str) -> Self {
        Self::new(libc::EBADF, format!("{what} is no longer open"))
    }
}

/// The value delivered by every task: absence of an error is the only
/// success signal.
pub type Outcome<T> = std::result::Result<T, ErrorOutcome>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: ErrorOutcome,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error("file {path} is not open")]
    NotOpen { path: String },

    #[error("file {path} is already open")]
    AlreadyOpen { path: String },

    #[error("file {path} has been closed")]
    Closed { path: String },

    #[error(transparent)]
    Native(#[from] ErrorOutcome),

    #[error("failed to load libhdfs3: {0}")]
    Library(#[from] libloading::Error),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
