//! Shared-ownership native handles with stable identifiers.
//!
//! A `Core<T>` is what wrapper instances hold. Native code may keep its own
//! clones alive independently of any proxy. Every handle gets a `CoreId` from
//! a process-wide counter at creation; ids are never reused, so a freed
//! handle can never alias a later one in an identity map.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u64);

impl CoreId {
    fn next() -> Self {
        CoreId(NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

pub struct Core<T: ?Sized> {
    id: CoreId,
    inner: Arc<T>,
}

impl<T> Core<T> {
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }
}

impl<T: ?Sized> Core<T> {
    /// Adopt an existing `Arc` as a new logical handle with a fresh id.
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self {
            id: CoreId::next(),
            inner,
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Number of live clones of this handle, proxies included.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.id == b.id
    }
}

impl<T: ?Sized> Clone for Core<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Deref for Core<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Core<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("value", &&*self.inner)
            .finish()
    }
}
