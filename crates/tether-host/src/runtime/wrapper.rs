//! Object wrappers: bind a native `Core` to a host-visible proxy.
//!
//! Each wrapper class implements [`Wrapper`]. The first creation attempt in
//! a context builds the class's [`Local`] registry by running
//! [`Wrapper::init`]; every later creation in that context reuses it. A proxy
//! can only come into existence through [`create`]: the constructor accepts
//! nothing except a single unconsumed payload produced by the factory.
//!
//! Lifecycle of an instance:
//!   construct hook → operations → destroy (explicit, or last host ref
//!   dropped) → destruct hook → native handle released
//!
//! After destroy every handle access fails with `AlreadyDestroyed`. Destroy
//! itself is idempotent and never fails.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, error, trace};

use super::context::ContextKey;
use super::error::{Error, HostError, Result};
use super::host::Env;
use super::identity::{Core, CoreId};
use super::value::{External, Function, HostObject, Object, Value, WeakObject};

/// Members every instance answers without the class declaring them.
pub const RESERVED_MEMBERS: &[&str] = &["type", "id", "tag", "toString", "destroy"];

/// A native type exposed to the host.
///
/// `Self` is the per-instance native state living inside the proxy;
/// `Self::Core` is the shared handle it wraps.
pub trait Wrapper: Sized + 'static {
    type Core: Send + Sync + 'static;

    /// Class name shown to the host (`type`, `toString`, error messages).
    const NAME: &'static str;

    /// Define the host-visible shape. Runs once per context.
    fn init(class: &mut ClassBuilder<Self>) -> Result<()>;

    /// Runs when a fresh proxy is bound to `core`.
    fn construct(env: &Env, core: &Core<Self::Core>) -> Result<Self>;

    /// Runs once, on the first destroy.
    fn destruct(&mut self, core: &Core<Self::Core>);

    /// Human description used for `tag`.
    fn describe(&self, core: &Core<Self::Core>) -> Result<String>;
}

// =============================================================================
// Class shape
// =============================================================================

type MethodFn<W> = Box<dyn Fn(&Instance<W>, &Env, &[Value]) -> Result<Value>>;
type GetterFn<W> = Box<dyn Fn(&Instance<W>, &Env) -> Result<Value>>;
type SetterFn<W> = Box<dyn Fn(&Instance<W>, &Env, Value) -> Result<()>>;

struct Accessor<W: Wrapper> {
    get: GetterFn<W>,
    set: Option<SetterFn<W>>,
}

struct Shape<W: Wrapper> {
    methods: HashMap<&'static str, MethodFn<W>>,
    accessors: HashMap<&'static str, Accessor<W>>,
}

pub struct ClassBuilder<W: Wrapper> {
    methods: HashMap<&'static str, MethodFn<W>>,
    accessors: HashMap<&'static str, Accessor<W>>,
    statics: Vec<(&'static str, Function)>,
    conflicts: Vec<&'static str>,
}

impl<W: Wrapper> ClassBuilder<W> {
    fn new() -> Self {
        Self {
            methods: HashMap::new(),
            accessors: HashMap::new(),
            statics: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn claim(&mut self, name: &'static str) -> bool {
        let taken = RESERVED_MEMBERS.contains(&name)
            || self.methods.contains_key(name)
            || self.accessors.contains_key(name);
        if taken {
            self.conflicts.push(name);
        }
        !taken
    }

    pub fn method<F>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(&Instance<W>, &Env, &[Value]) -> Result<Value> + 'static,
    {
        if self.claim(name) {
            self.methods.insert(name, Box::new(f));
        }
        self
    }

    /// Read-only property.
    pub fn getter<G>(&mut self, name: &'static str, get: G) -> &mut Self
    where
        G: Fn(&Instance<W>, &Env) -> Result<Value> + 'static,
    {
        if self.claim(name) {
            self.accessors.insert(
                name,
                Accessor {
                    get: Box::new(get),
                    set: None,
                },
            );
        }
        self
    }

    pub fn accessor<G, S>(&mut self, name: &'static str, get: G, set: S) -> &mut Self
    where
        G: Fn(&Instance<W>, &Env) -> Result<Value> + 'static,
        S: Fn(&Instance<W>, &Env, Value) -> Result<()> + 'static,
    {
        if self.claim(name) {
            self.accessors.insert(
                name,
                Accessor {
                    get: Box::new(get),
                    set: Some(Box::new(set)),
                },
            );
        }
        self
    }

    /// Function attached to the constructor, e.g. a `create` factory.
    pub fn static_method<F>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(&Env, &[Value]) -> Result<Value> + 'static,
    {
        if self.statics.iter().any(|(n, _)| *n == name) {
            self.conflicts.push(name);
        } else {
            let qualified = format!("{}.{name}", W::NAME);
            self.statics.push((name, Function::new(qualified, f)));
        }
        self
    }

    fn finish(self) -> Result<(Shape<W>, Vec<(&'static str, Function)>)> {
        if !self.conflicts.is_empty() {
            let names: Vec<String> = self.conflicts.iter().map(|n| format!("`{n}`")).collect();
            return Err(Error::initialization(
                W::NAME,
                format!("duplicate or reserved member {}", names.join(", ")),
            ));
        }
        let shape = Shape {
            methods: self.methods,
            accessors: self.accessors,
        };
        Ok((shape, self.statics))
    }
}

// =============================================================================
// Local: per (class, context) registry
// =============================================================================

pub struct Local<W: Wrapper> {
    key: ContextKey,
    shape: Shape<W>,
    constructor: Function,
    strict_identity: bool,
    instances: RefCell<HashMap<CoreId, WeakObject>>,
}

impl<W: Wrapper> Local<W> {
    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn constructor(&self) -> &Function {
        &self.constructor
    }

    pub fn strict_identity(&self) -> bool {
        self.strict_identity
    }

    /// Entries in the identity map whose proxy is still alive.
    pub fn live_identities(&self) -> usize {
        self.instances
            .borrow()
            .values()
            .filter(|weak| weak.is_live())
            .count()
    }

    fn lookup(&self, id: CoreId) -> Option<Object> {
        let mut instances = self.instances.borrow_mut();
        match instances.get(&id).map(WeakObject::upgrade) {
            Some(Some(object)) => Some(object),
            Some(None) => {
                trace!(class = W::NAME, id = %id, "discarding stale identity");
                instances.remove(&id);
                None
            }
            None => None,
        }
    }

    fn remember(&self, id: CoreId, object: &Object) {
        let previous = self.instances.borrow_mut().insert(id, object.downgrade());
        drop(previous);
    }

    fn forget(&self, id: CoreId) {
        let previous = self.instances.borrow_mut().remove(&id);
        drop(previous);
    }
}

/// Resolve the class registry for this context, building it on first use.
///
/// A failed `init` caches nothing; the next attempt runs it again.
pub fn local<W: Wrapper>(env: &Env) -> Result<Rc<Local<W>>> {
    let type_id = TypeId::of::<W>();
    if let Some(entry) = env.class_entry(type_id) {
        return downcast_local::<W>(entry);
    }
    if env.is_torn_down() {
        return Err(Error::NotInitialized(W::NAME));
    }

    let mut builder = ClassBuilder::<W>::new();
    W::init(&mut builder).map_err(|err| match err {
        Error::Initialization { .. } => err,
        other => Error::initialization(W::NAME, other.to_string()),
    })?;
    let (shape, statics) = builder.finish()?;

    let constructor = Function::new(W::NAME, construct_from_payload::<W>);
    for (name, function) in statics {
        constructor.set(name, Value::Function(function));
    }

    // `init` may itself have created an instance of this class.
    if let Some(entry) = env.class_entry(type_id) {
        return downcast_local::<W>(entry);
    }

    let local = Rc::new(Local {
        key: env.key(),
        shape,
        constructor,
        strict_identity: env.config().strict_identity,
        instances: RefCell::new(HashMap::new()),
    });
    env.insert_class(type_id, Rc::clone(&local) as Rc<dyn std::any::Any>);
    env.add_cleanup_hook(move |env| {
        if env.remove_class(type_id).is_some() {
            debug!(context = %env.key(), class = W::NAME, "class registry released");
        }
    });

    debug!(context = %env.key(), class = W::NAME, strict_identity = local.strict_identity, "class registered");
    Ok(local)
}

fn downcast_local<W: Wrapper>(entry: Rc<dyn std::any::Any>) -> Result<Rc<Local<W>>> {
    entry
        .downcast::<Local<W>>()
        .map_err(|_| Error::Unknown(format!("class table entry for {} has the wrong type", W::NAME)))
}

// =============================================================================
// Factory
// =============================================================================

struct Payload<W: Wrapper> {
    local: Rc<Local<W>>,
    core: Core<W::Core>,
}

/// The class constructor. Accepts exactly one payload from [`try_create`].
fn construct_from_payload<W: Wrapper>(env: &Env, args: &[Value]) -> Result<Value> {
    let [Value::External(payload)] = args else {
        return Err(Error::type_mismatch(format!(
            "{} cannot be constructed directly; use its factory",
            W::NAME
        )));
    };
    let Payload { local, core } = payload.take::<Payload<W>>()?;

    let wrapper = W::construct(env, &core)?;
    let instance = Instance {
        local,
        core_id: core.id(),
        bound: RefCell::new(Some(Bound { wrapper, core })),
        destroy_deferred: Cell::new(false),
    };
    debug!(class = W::NAME, id = %instance.core_id, "constructed");
    Ok(Value::Object(Object::new(instance)))
}

/// Bind `core` to a proxy in this context, reusing the live proxy when
/// identity preservation is enabled.
pub fn try_create<W: Wrapper>(env: &Env, core: &Core<W::Core>) -> Result<Object> {
    let local = local::<W>(env)?;

    if local.strict_identity {
        if let Some(existing) = local.lookup(core.id()) {
            return Ok(existing);
        }
    }

    let payload = External::new(Payload::<W> {
        local: Rc::clone(&local),
        core: core.clone(),
    });
    let object = match local.constructor.invoke(env, &[Value::External(payload)])? {
        Value::Object(object) => object,
        other => {
            return Err(Error::Unknown(format!(
                "{} constructor returned {}",
                W::NAME,
                other.type_name()
            )))
        }
    };

    if local.strict_identity {
        local.remember(core.id(), &object);
    }
    Ok(object)
}

pub fn try_create_with<W: Wrapper>(env: &Env, value: W::Core) -> Result<Object> {
    try_create::<W>(env, &Core::new(value))
}

/// Host-facing creation: on failure the error becomes the pending exception
/// and the result is `Value::Undefined`.
pub fn create<W: Wrapper>(env: &Env, core: &Core<W::Core>) -> Value {
    env.boundary(|| try_create::<W>(env, core))
        .map(Value::Object)
        .unwrap_or_default()
}

pub fn create_with<W: Wrapper>(env: &Env, value: W::Core) -> Value {
    create::<W>(env, &Core::new(value))
}

/// Register the class and publish its constructor as a global.
pub fn export<W: Wrapper>(env: &Env) -> Result<Function> {
    let local = local::<W>(env)?;
    let constructor = local.constructor.clone();
    env.set_global(W::NAME, Value::Function(constructor.clone()));
    Ok(constructor)
}

// =============================================================================
// Instance: the proxy's private slot
// =============================================================================

struct Bound<W: Wrapper> {
    wrapper: W,
    core: Core<W::Core>,
}

pub struct Instance<W: Wrapper> {
    local: Rc<Local<W>>,
    core_id: CoreId,
    bound: RefCell<Option<Bound<W>>>,
    /// Set when `destroy` ran while an operation held the slot.
    destroy_deferred: Cell<bool>,
}

impl<W: Wrapper> Instance<W> {
    /// Recover the typed instance behind a host value.
    pub fn unwrap(value: &Value) -> Result<&Instance<W>> {
        value
            .as_object()
            .and_then(|object| object.downcast_ref::<Instance<W>>())
            .ok_or_else(|| {
                Error::type_mismatch(format!(
                    "expected {}, got {}",
                    W::NAME,
                    value.type_name()
                ))
            })
    }

    pub fn local(&self) -> &Rc<Local<W>> {
        &self.local
    }

    pub fn is_destroyed(&self) -> bool {
        match self.bound.try_borrow() {
            Ok(bound) => bound.is_none(),
            Err(_) => false,
        }
    }

    /// Clone of the wrapped handle.
    pub fn core(&self) -> Result<Core<W::Core>> {
        self.with(|_, core| core.clone())
    }

    pub fn with<R>(&self, f: impl FnOnce(&W, &Core<W::Core>) -> R) -> Result<R> {
        let result = {
            let bound = self.bound.try_borrow().map_err(|_| self.reentrant())?;
            let bound = bound.as_ref().ok_or(Error::AlreadyDestroyed(W::NAME))?;
            f(&bound.wrapper, &bound.core)
        };
        self.finish_deferred_destroy();
        Ok(result)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut W, &Core<W::Core>) -> R) -> Result<R> {
        let result = {
            let mut bound = self.bound.try_borrow_mut().map_err(|_| self.reentrant())?;
            let bound = bound.as_mut().ok_or(Error::AlreadyDestroyed(W::NAME))?;
            f(&mut bound.wrapper, &bound.core)
        };
        self.finish_deferred_destroy();
        Ok(result)
    }

    /// Hex form of the core's stable id.
    pub fn id(&self) -> Result<String> {
        self.with(|_, core| core.id().to_string())
    }

    /// `describe` hook output, or a placeholder if it fails or panics.
    /// Fails only when the handle itself is unavailable.
    pub fn tag(&self) -> Result<String> {
        let described = self.with(|wrapper, core| {
            catch_unwind(AssertUnwindSafe(|| wrapper.describe(core)))
        })?;
        Ok(match described {
            Ok(Ok(tag)) => tag,
            _ => format!("error in {}::describe()", W::NAME),
        })
    }

    pub fn display(&self) -> Result<String> {
        Ok(format!("{} [{}]", W::NAME, self.tag()?))
    }

    /// Run the destruct hook and release the handle. No-op after the first call.
    pub fn destroy(&self) {
        let bound = match self.bound.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                debug!(class = W::NAME, id = %self.core_id, "instance in use, destroy deferred");
                self.destroy_deferred.set(true);
                return;
            }
        };
        let Some(Bound { mut wrapper, core }) = bound else {
            return;
        };

        if self.local.strict_identity {
            self.local.forget(self.core_id);
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| wrapper.destruct(&core))) {
            let err = HostError::from_panic(payload);
            error!(class = W::NAME, id = %self.core_id, message = err.message(), "destruct hook panicked");
        }
        debug!(class = W::NAME, id = %self.core_id, "destroyed");
        drop(wrapper);
        drop(core);
    }

    fn finish_deferred_destroy(&self) {
        if self.destroy_deferred.replace(false) {
            self.destroy();
        }
    }

    fn reentrant(&self) -> Error {
        Error::Unknown(format!(
            "{} {} is already borrowed by a running operation",
            W::NAME,
            self.core_id
        ))
    }
}

impl<W: Wrapper> HostObject for Instance<W> {
    fn class_name(&self) -> &str {
        W::NAME
    }

    fn invoke(&self, env: &Env, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "toString" => self.display().map(Value::from),
            "destroy" => {
                self.destroy();
                Ok(Value::Undefined)
            }
            _ => match self.local.shape.methods.get(method) {
                Some(f) => f(self, env, args),
                None => Err(Error::type_mismatch(format!(
                    "{}.{method} is not a function",
                    W::NAME
                ))),
            },
        }
    }

    fn get(&self, env: &Env, name: &str) -> Result<Value> {
        match name {
            "type" => Ok(Value::from(W::NAME)),
            "id" => self.id().map(Value::from),
            "tag" => self.tag().map(Value::from),
            _ => match self.local.shape.accessors.get(name) {
                Some(accessor) => (accessor.get)(self, env),
                None => Ok(Value::Undefined),
            },
        }
    }

    fn set(&self, env: &Env, name: &str, value: Value) -> Result<()> {
        let setter = self
            .local
            .shape
            .accessors
            .get(name)
            .and_then(|accessor| accessor.set.as_ref());
        match setter {
            Some(set) => set(self, env, value),
            None if RESERVED_MEMBERS.contains(&name)
                || self.local.shape.accessors.contains_key(name) =>
            {
                Err(Error::type_mismatch(format!(
                    "cannot assign to read only property `{name}` of {}",
                    W::NAME
                )))
            }
            None => Err(Error::type_mismatch(format!(
                "{} has no property `{name}`",
                W::NAME
            ))),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl<W: Wrapper> Drop for Instance<W> {
    fn drop(&mut self) {
        self.destroy();
    }
}
