//! Single-owner native resources.

use log::warn;

use crate::error::Outcome;

/// A native handle that can be given back to the library exactly once.
pub trait Release {
    /// Label used in log lines.
    const KIND: &'static str;

    fn release(self) -> Outcome<()>;
}

/// Exclusive owner of one native resource.
///
/// `close` is idempotent: once the resource has been released, further
/// calls succeed without touching the library. A resource still held when
/// the owner is dropped is released then; a failure at that point is
/// logged and swallowed.
pub struct Resource<R: Release> {
    inner: Option<R>,
    label: String,
}

impl<R: Release> Resource<R> {
    pub fn new(inner: R, label: impl Into<String>) -> Self {
        Self {
            inner: Some(inner),
            label: label.into(),
        }
    }

    pub fn get(&self) -> Option<&R> {
        self.inner.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn close(&mut self) -> Outcome<()> {
        match self.inner.take() {
            Some(resource) => resource.release(),
            None => Ok(()),
        }
    }
}

impl<R: Release> Drop for Resource<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.inner.take() {
            if let Err(e) = resource.release() {
                warn!("releasing {} {} failed: {e}", R::KIND, self.label);
            }
        }
    }
}
