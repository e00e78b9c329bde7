//! Host value model: the subset of a scripting runtime's values the core
//! needs: primitives, opaque external payloads, host functions and objects.
//!
//! Everything here lives on the host thread (`Rc`, not `Arc`). Dropping the
//! last `Object` for a host object is the host's garbage collection.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use super::error::{Error, Result};
use super::host::Env;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    External(External),
    Function(Function),
    Object(Object),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::External(_) => "external",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Strict equality: primitives by value, references by identity.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::External(a), Value::External(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::Function(a), Value::Function(b)) => Function::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Object::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::External(_) => f.write_str("[external]"),
            Value::Function(func) => write!(f, "[function {}]", func.name()),
            Value::Object(obj) => write!(f, "[object {}]", obj.class_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

// =============================================================================
// External: take-once opaque payload
// =============================================================================

#[derive(Clone)]
pub struct External(Rc<RefCell<Option<Box<dyn Any>>>>);

impl External {
    pub fn new<T: 'static>(value: T) -> Self {
        External(Rc::new(RefCell::new(Some(Box::new(value)))))
    }

    pub fn is_consumed(&self) -> bool {
        self.0.borrow().is_none()
    }

    /// Move the payload out. A payload of another type is left in place.
    pub fn take<T: 'static>(&self) -> Result<T> {
        let mut slot = self.0.borrow_mut();
        match slot.take() {
            None => Err(Error::type_mismatch("external payload already consumed")),
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(other) => {
                    *slot = Some(other);
                    Err(Error::type_mismatch(format!(
                        "external payload is not a {}",
                        type_name::<T>()
                    )))
                }
            },
        }
    }
}

// =============================================================================
// Function: named host function with a property table
// =============================================================================

type NativeFn = dyn Fn(&Env, &[Value]) -> Result<Value>;

struct FunctionInner {
    name: String,
    body: Box<NativeFn>,
    props: RefCell<BTreeMap<String, Value>>,
}

#[derive(Clone)]
pub struct Function(Rc<FunctionInner>);

impl Function {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Env, &[Value]) -> Result<Value> + 'static,
    {
        Function(Rc::new(FunctionInner {
            name: name.into(),
            body: Box::new(body),
            props: RefCell::new(BTreeMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Call without a boundary. Host-side callers go through `Env`.
    pub fn invoke(&self, env: &Env, args: &[Value]) -> Result<Value> {
        (self.0.body)(env, args)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.props.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        let previous = self.0.props.borrow_mut().insert(name.into(), value);
        drop(previous);
    }

    pub fn ptr_eq(a: &Function, b: &Function) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

// =============================================================================
// Object: host-visible object backed by native behavior
// =============================================================================

pub trait HostObject: Any {
    fn class_name(&self) -> &str;
    fn invoke(&self, env: &Env, method: &str, args: &[Value]) -> Result<Value>;
    fn get(&self, env: &Env, name: &str) -> Result<Value>;
    fn set(&self, env: &Env, name: &str, value: Value) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub struct Object(Rc<dyn HostObject>);

impl Object {
    pub fn new<O: HostObject>(object: O) -> Self {
        Object(Rc::new(object))
    }

    pub fn class_name(&self) -> &str {
        self.0.class_name()
    }

    pub fn invoke(&self, env: &Env, method: &str, args: &[Value]) -> Result<Value> {
        self.0.invoke(env, method, args)
    }

    pub fn get(&self, env: &Env, name: &str) -> Result<Value> {
        self.0.get(env, name)
    }

    pub fn set(&self, env: &Env, name: &str, value: Value) -> Result<()> {
        self.0.set(env, name, value)
    }

    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Live host references to this object.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.class_name())
    }
}

/// Collectable handle; does not keep the object alive.
#[derive(Clone)]
pub struct WeakObject(Weak<dyn HostObject>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.0.upgrade().map(Object)
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Iterator protocol step: `{ value, done }`.
pub struct IterStep {
    value: Value,
    done: bool,
}

impl IterStep {
    pub fn new(value: Value, done: bool) -> Self {
        Self { value, done }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn done(&self) -> bool {
        self.done
    }
}

impl HostObject for IterStep {
    fn class_name(&self) -> &str {
        "IterStep"
    }

    fn invoke(&self, _env: &Env, method: &str, _args: &[Value]) -> Result<Value> {
        Err(Error::type_mismatch(format!("IterStep.{method} is not a function")))
    }

    fn get(&self, _env: &Env, name: &str) -> Result<Value> {
        Ok(match name {
            "value" => self.value.clone(),
            "done" => Value::Bool(self.done),
            _ => Value::Undefined,
        })
    }

    fn set(&self, _env: &Env, name: &str, _value: Value) -> Result<()> {
        Err(Error::type_mismatch(format!(
            "cannot assign to read only property `{name}` of IterStep"
        )))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
