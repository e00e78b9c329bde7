//! Host context: the single-threaded side of the bridge.
//!
//! `Host` owns one context: its event loop, dispatcher, per-class registry
//! set, global table and pending-exception slot. `Env` is the cheap handle
//! passed to tasks and wrapper operations.
//!
//! RefCell discipline: no borrow of the class table, global table or hook
//! list is held while user code runs. Every accessor follows
//! borrow → extract → drop borrow → call.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::config::RuntimeConfig;
use super::context::{ContextKey, ContextRegistry, Remote};
use super::dispatcher::Dispatcher;
use super::error::{Error, HostError, Result};
use super::event_loop::EventLoop;
use super::value::Value;

type CleanupHook = Box<dyn FnOnce(&Env)>;

struct EnvInner {
    key: ContextKey,
    registry: ContextRegistry,
    event_loop: EventLoop,
    dispatcher: RefCell<Option<Arc<Dispatcher>>>,
    classes: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
    globals: RefCell<BTreeMap<String, Value>>,
    exception: RefCell<Option<HostError>>,
    cleanup_hooks: RefCell<Vec<CleanupHook>>,
    torn_down: Cell<bool>,
}

#[derive(Clone)]
pub struct Env {
    inner: Rc<EnvInner>,
}

impl Env {
    fn new(key: ContextKey, registry: ContextRegistry) -> Self {
        Self {
            inner: Rc::new(EnvInner {
                key,
                registry,
                event_loop: EventLoop::new(),
                dispatcher: RefCell::new(None),
                classes: RefCell::new(HashMap::new()),
                globals: RefCell::new(BTreeMap::new()),
                exception: RefCell::new(None),
                cleanup_hooks: RefCell::new(Vec::new()),
                torn_down: Cell::new(false),
            }),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.inner.key
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.inner.registry.config()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn remote(&self) -> Remote {
        self.inner.registry.remote(self.inner.key)
    }

    pub fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.inner
            .dispatcher
            .borrow()
            .clone()
            .ok_or(Error::NotInitialized("dispatcher"))
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        *self.inner.dispatcher.borrow_mut() = Some(dispatcher);
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.get()
    }

    /// Register a teardown notification. Hooks run last-registered first.
    pub fn add_cleanup_hook(&self, hook: impl FnOnce(&Env) + 'static) {
        self.inner.cleanup_hooks.borrow_mut().push(Box::new(hook));
    }

    // =========================================================================
    // Per-class state
    // =========================================================================

    pub(crate) fn class_entry(&self, id: TypeId) -> Option<Rc<dyn Any>> {
        self.inner.classes.borrow().get(&id).cloned()
    }

    pub(crate) fn insert_class(&self, id: TypeId, entry: Rc<dyn Any>) {
        let previous = self.inner.classes.borrow_mut().insert(id, entry);
        drop(previous);
    }

    pub(crate) fn remove_class(&self, id: TypeId) -> Option<Rc<dyn Any>> {
        self.inner.classes.borrow_mut().remove(&id)
    }

    // =========================================================================
    // Globals
    // =========================================================================

    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.globals.borrow().get(name).cloned()
    }

    pub fn set_global(&self, name: impl Into<String>, value: Value) {
        let previous = self.inner.globals.borrow_mut().insert(name.into(), value);
        drop(previous);
    }

    pub fn remove_global(&self, name: &str) -> Option<Value> {
        self.inner.globals.borrow_mut().remove(name)
    }

    // =========================================================================
    // Exceptions and the native → host boundary
    // =========================================================================

    /// Make `err` the pending exception.
    pub fn throw(&self, err: HostError) {
        let previous = self.inner.exception.borrow_mut().replace(err);
        if let Some(previous) = previous {
            warn!(context = %self.key(), dropped = %previous, "pending exception replaced");
        }
    }

    pub fn take_exception(&self) -> Option<HostError> {
        self.inner.exception.borrow_mut().take()
    }

    pub fn has_exception(&self) -> bool {
        self.inner.exception.borrow().is_some()
    }

    /// Run native code, converting both errors and panics into `HostError`.
    pub fn catch<R>(&self, f: impl FnOnce() -> Result<R>) -> std::result::Result<R, HostError> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(HostError::from(err)),
            Err(payload) => Err(HostError::from_panic(payload)),
        }
    }

    /// Like `catch`, but a failure becomes the pending exception and the
    /// caller gets `None`.
    pub fn boundary<R>(&self, f: impl FnOnce() -> Result<R>) -> Option<R> {
        match self.catch(f) {
            Ok(value) => Some(value),
            Err(err) => {
                self.throw(err);
                None
            }
        }
    }

    // =========================================================================
    // Host-side operations
    // =========================================================================

    /// `target.method(...args)`. Functions are searched for a static of that
    /// name.
    pub fn call(
        &self,
        target: &Value,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, HostError> {
        self.catch(|| match target {
            Value::Object(object) => object.invoke(self, method, args),
            Value::Function(function) => match function.get(method) {
                Some(Value::Function(f)) => f.invoke(self, args),
                _ => Err(Error::type_mismatch(format!(
                    "{}.{method} is not a function",
                    function.name()
                ))),
            },
            other => Err(Error::type_mismatch(format!(
                "cannot call `{method}` on {}",
                other.type_name()
            ))),
        })
    }

    pub fn call_function(
        &self,
        function: &Value,
        args: &[Value],
    ) -> std::result::Result<Value, HostError> {
        self.catch(|| match function {
            Value::Function(f) => f.invoke(self, args),
            other => Err(Error::type_mismatch(format!(
                "{} is not a function",
                other.type_name()
            ))),
        })
    }

    pub fn get(&self, target: &Value, name: &str) -> std::result::Result<Value, HostError> {
        self.catch(|| match target {
            Value::Object(object) => object.get(self, name),
            Value::Function(function) => Ok(function.get(name).unwrap_or_default()),
            other => Err(Error::type_mismatch(format!(
                "cannot read `{name}` of {}",
                other.type_name()
            ))),
        })
    }

    pub fn set(
        &self,
        target: &Value,
        name: &str,
        value: Value,
    ) -> std::result::Result<(), HostError> {
        self.catch(|| match target {
            Value::Object(object) => object.set(self, name, value),
            other => Err(Error::type_mismatch(format!(
                "cannot assign `{name}` on {}",
                other.type_name()
            ))),
        })
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    fn teardown(&self) {
        if self.inner.torn_down.replace(true) {
            return;
        }

        loop {
            let hook = self.inner.cleanup_hooks.borrow_mut().pop();
            let Some(hook) = hook else { break };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(self))) {
                let err = HostError::from_panic(payload);
                error!(context = %self.key(), message = err.message(), "cleanup hook panicked");
            }
        }

        // Values may hold proxies whose destruct hooks run here.
        let globals = std::mem::take(&mut *self.inner.globals.borrow_mut());
        drop(globals);
        let classes = std::mem::take(&mut *self.inner.classes.borrow_mut());
        drop(classes);
        let exception = self.inner.exception.borrow_mut().take();
        drop(exception);
        let dispatcher = self.inner.dispatcher.borrow_mut().take();
        drop(dispatcher);

        self.inner.event_loop.close();
        debug!(context = %self.key(), "context torn down");
    }
}

// =============================================================================
// Host
// =============================================================================

/// Owner of one host context. Dropping it tears the context down.
pub struct Host {
    env: Env,
}

impl Host {
    /// Open a new context on `registry` and initialize its dispatcher.
    pub fn open(registry: &ContextRegistry) -> Result<Host> {
        let env = Env::new(ContextKey::next(), registry.clone());
        // Dropping `host` on failure runs whatever hooks were registered.
        let host = Host { env };
        Dispatcher::init(&host.env)?;
        debug!(context = %host.env.key(), "context opened");
        Ok(host)
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Run every queued task now, without waiting.
    pub fn drain(&self) -> usize {
        match self.env.dispatcher() {
            Ok(dispatcher) => dispatcher.drain(&self.env),
            Err(_) => 0,
        }
    }

    /// Wait up to `timeout` for a wake, then drain. Returns tasks run.
    pub fn turn(&self, timeout: Duration) -> usize {
        let event_loop = self.env.event_loop();
        if !event_loop.take_pending() {
            event_loop.wait(timeout);
        }
        self.drain()
    }

    /// Drive the loop until nothing keeps it alive. Returns tasks run.
    pub fn run(&self) -> usize {
        let poll_interval = self.env.config().poll_interval;
        let event_loop = self.env.event_loop();
        let mut ran = 0;
        loop {
            ran += self.drain();
            if !event_loop.is_alive() {
                break;
            }
            event_loop.wait(poll_interval);
        }
        ran
    }

    pub fn is_alive(&self) -> bool {
        self.env.event_loop().is_alive()
    }
}

impl Deref for Host {
    type Target = Env;

    fn deref(&self) -> &Env {
        &self.env
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.env.teardown();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::runtime::error::ErrorKind;
    use crate::runtime::value::Function;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host() -> Host {
        Host::open(&ContextRegistry::new()).unwrap()
    }

    #[test]
    fn boundary_converts_errors_and_panics() {
        let host = host();

        assert_eq!(host.boundary(|| Ok(3)), Some(3));
        assert!(!host.has_exception());

        assert_eq!(host.boundary(|| -> Result<()> { Err(Error::AlreadyClosed) }), None);
        let err = host.take_exception().unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);

        assert_eq!(host.boundary(|| -> Result<()> { panic!("native fault") }), None);
        let err = host.take_exception().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.message(), "native fault");
        assert!(!host.has_exception());
    }

    #[test]
    fn call_rejects_non_callables() {
        let host = host();
        let err = host.call(&Value::Number(1.0), "increment", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = host.call_function(&Value::Null, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let f = Value::Function(Function::new("Thing", |_, _| Ok(Value::Null)));
        let err = host.call(&f, "missing", &[]).unwrap_err();
        assert!(err.message().contains("Thing.missing is not a function"));
    }

    #[test]
    fn cleanup_hooks_run_once_in_reverse() {
        let registry = ContextRegistry::new();
        let host = Host::open(&registry).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = Rc::clone(&order);
            host.add_cleanup_hook(move |_| order.borrow_mut().push(i));
        }

        let env = host.env().clone();
        drop(host);
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
        assert!(env.is_torn_down());
        assert!(env.dispatcher().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn run_returns_once_idle() {
        let host = host();
        let ran = Arc::new(AtomicUsize::new(0));
        let remote = host.remote();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let remote = remote.clone();
                let ran = Arc::clone(&ran);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let ran = Arc::clone(&ran);
                        remote
                            .dispatch(move |_| {
                                ran.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(host.run(), 100);
        assert_eq!(ran.load(Ordering::SeqCst), 100);
        assert!(!host.is_alive());
    }

    #[test]
    fn turn_picks_up_cross_thread_work() {
        let host = host();
        let remote = host.remote();
        let worker = std::thread::spawn(move || {
            remote.dispatch(|env| env.set_global("done", true.into())).unwrap();
        });
        worker.join().unwrap();

        assert_eq!(host.turn(Duration::from_secs(1)), 1);
        assert_eq!(host.global("done").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(host.turn(Duration::from_millis(1)), 0);
    }

    #[test]
    fn idle_turn_waits_for_late_work() {
        let host = host();
        let remote = host.remote();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.dispatch(|env| env.set_global("late", true.into())).unwrap();
        });

        assert!(!host.is_alive());
        let started = std::time::Instant::now();
        let ran = host.turn(Duration::from_secs(5));
        worker.join().unwrap();

        // The wake may land between the dispatch's enqueue and its send.
        let ran = ran + host.drain();
        assert_eq!(ran, 1);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(host.global("late").and_then(|v| v.as_bool()), Some(true));
    }
}
