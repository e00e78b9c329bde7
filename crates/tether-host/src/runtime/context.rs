//! Context Registry: context key → dispatcher, owned by whoever manages
//! context lifetimes.
//!
//! Cloning a `ContextRegistry` shares the same table. The lock covers
//! lookup, insert and erase only; dispatchers are cloned out before any
//! call into them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::config::RuntimeConfig;
use super::dispatcher::Dispatcher;
use super::error::{Error, Result};
use super::host::Env;
use super::sync::{lock, Mutex};

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one host context. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(u64);

impl ContextKey {
    pub(crate) fn next() -> Self {
        ContextKey(NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

struct RegistryInner {
    contexts: Mutex<HashMap<ContextKey, Arc<Dispatcher>>>,
    config: RuntimeConfig,
}

#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                contexts: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn register(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let key = dispatcher.key();
        let mut contexts = lock(&self.inner.contexts);
        if contexts.contains_key(&key) {
            return Err(Error::initialization(
                "dispatcher",
                "already initialized for this context",
            ));
        }
        contexts.insert(key, dispatcher);
        Ok(())
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        lock(&self.inner.contexts).contains_key(&key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.contexts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatcher(&self, key: ContextKey) -> Result<Arc<Dispatcher>> {
        lock(&self.inner.contexts)
            .get(&key)
            .cloned()
            .ok_or(Error::NotInitialized("dispatcher"))
    }

    /// Schedule `task` on the host thread of `key`. Callable from any thread.
    ///
    /// Fails with `NotInitialized` when the context was never registered or
    /// has torn down; the task is dropped.
    pub fn dispatch<F>(&self, key: ContextKey, task: F) -> Result<()>
    where
        F: FnOnce(&Env) + Send + 'static,
    {
        self.dispatcher(key)?.enqueue(Box::new(task))
    }

    pub fn remote(&self, key: ContextKey) -> Remote {
        Remote {
            registry: self.clone(),
            key,
        }
    }

    /// Remove the context and shut its dispatcher down.
    /// Returns false if the key was unknown.
    pub fn teardown(&self, key: ContextKey) -> bool {
        let removed = lock(&self.inner.contexts).remove(&key);
        match removed {
            Some(dispatcher) => {
                dispatcher.shutdown();
                debug!(context = %key, "context removed from registry");
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Remote: the handle worker threads carry
// =============================================================================

/// Dispatch handle for one context. `Send + Sync + Clone`.
#[derive(Clone)]
pub struct Remote {
    registry: ContextRegistry,
    key: ContextKey,
}

impl Remote {
    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn dispatch<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&Env) + Send + 'static,
    {
        self.registry.dispatch(self.key, task)
    }

    /// False once the context has torn down.
    pub fn is_connected(&self) -> bool {
        self.registry.contains(self.key)
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote").field("key", &self.key).finish()
    }
}
