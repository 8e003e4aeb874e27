//! Single-entry memoized slots used for lazily built per-domain and
//! per-backend artifacts.
//!
//! Each slot is guarded by its own mutex, held while the value is built, so at
//! most one build runs per slot at a time. Values are handed out as `Arc`s;
//! replacing a value never invalidates a copy a caller already holds.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A value built on first use and kept for the lifetime of the slot
pub struct Memo<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Memo<T> {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// The cached value, if it has been built
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    /// Return the cached value, building it first if the slot is empty.
    /// A failed build leaves the slot empty.
    pub fn get_or_try_init<E>(&self, build: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock();
        if let Some(value) = slot.as_ref() {
            return Ok(value.clone());
        }
        let value = Arc::new(build()?);
        *slot = Some(value.clone());
        Ok(value)
    }
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("populated", &self.slot.lock().is_some())
            .finish()
    }
}

struct Stamped<S, T> {
    stamp: Option<S>,
    value: Option<Arc<T>>,
}

/// A memoized value tied to a version stamp (e.g. a file modification time).
///
/// The value is valid while the stored stamp is not older than the stamp
/// observed by the caller; an older stamp drops the value and the next
/// lookup rebuilds it.
pub struct StampedMemo<S, T> {
    inner: Mutex<Stamped<S, T>>,
}

impl<S: PartialOrd + Copy, T> StampedMemo<S, T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Stamped { stamp: None, value: None }),
        }
    }

    /// Stamp the current value was built against
    pub fn stamp(&self) -> Option<S> {
        self.inner.lock().stamp
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.lock().value.clone()
    }

    /// Return the cached value for `current`, rebuilding when the stored
    /// stamp is older or no value is cached.
    ///
    /// The stamp advances before the build runs, so a failed build leaves
    /// the slot empty but stamped; the next call retries the build.
    pub fn get_or_try_refresh<E>(
        &self,
        current: S,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        let mut inner = self.inner.lock();
        if inner.stamp.map_or(true, |stamp| stamp < current) {
            inner.value = None;
            inner.stamp = Some(current);
        }
        if let Some(value) = inner.value.as_ref() {
            return Ok(value.clone());
        }
        let value = Arc::new(build()?);
        inner.value = Some(value.clone());
        Ok(value)
    }
}

impl<S: PartialOrd + Copy, T> Default for StampedMemo<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: fmt::Debug, T> fmt::Debug for StampedMemo<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StampedMemo")
            .field("stamp", &inner.stamp)
            .field("populated", &inner.value.is_some())
            .finish()
    }
}
