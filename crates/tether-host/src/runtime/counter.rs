//! Counter: a wrapper over a shared atomic integer.
//!
//! Host surface:
//!   Counter.create(seed?)   seed is used only when it is a number
//!   counter.increment()     returns the new value
//!   counter.next()          increments; returns an `IterStep` { value, done: false }
//!   counter.value           read/write; writes must be numbers
//!   counter.increments      increments made through this proxy

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::trace;

use super::error::{Error, Result};
use super::host::Env;
use super::identity::Core;
use super::value::{IterStep, Object, Value};
use super::wrapper::{try_create_with, ClassBuilder, Instance, Wrapper};

pub struct Counter {
    increments: u64,
}

impl Wrapper for Counter {
    type Core = AtomicI64;
    const NAME: &'static str = "Counter";

    fn init(class: &mut ClassBuilder<Self>) -> Result<()> {
        class
            .static_method("create", |env, args| {
                let seed = args.first().and_then(Value::as_number).unwrap_or(0.0);
                try_create_with::<Counter>(env, AtomicI64::new(seed as i64)).map(Value::Object)
            })
            .method("increment", increment)
            .method("next", |this, env, args| {
                let value = increment(this, env, args)?;
                Ok(Value::Object(Object::new(IterStep::new(value, false))))
            })
            .accessor("value", get_value, set_value)
            .getter("increments", |this, _env| {
                this.with(|counter, _| Value::from(counter.increments as f64))
            });
        Ok(())
    }

    fn construct(_env: &Env, core: &Core<AtomicI64>) -> Result<Self> {
        trace!(id = %core.id(), seed = core.load(Ordering::SeqCst), "counter bound");
        Ok(Counter { increments: 0 })
    }

    fn destruct(&mut self, core: &Core<AtomicI64>) {
        trace!(id = %core.id(), increments = self.increments, "counter released");
    }

    fn describe(&self, core: &Core<AtomicI64>) -> Result<String> {
        Ok(format!("value={}", core.load(Ordering::SeqCst)))
    }
}

fn increment(this: &Instance<Counter>, _env: &Env, _args: &[Value]) -> Result<Value> {
    this.with_mut(|counter, core| -> Result<Value> {
        let previous = core
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|n| Error::Unknown(format!("Counter value {n} cannot be incremented")))?;
        counter.increments += 1;
        Ok(Value::from(previous + 1))
    })?
}

fn get_value(this: &Instance<Counter>, _env: &Env) -> Result<Value> {
    Ok(Value::from(this.core()?.load(Ordering::SeqCst)))
}

fn set_value(this: &Instance<Counter>, _env: &Env, value: Value) -> Result<()> {
    let Some(n) = value.as_number() else {
        return Err(Error::type_mismatch("Value must be a number"));
    };
    this.core()?.store(n as i64, Ordering::SeqCst);
    Ok(())
}
