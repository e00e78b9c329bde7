//! tether-host: expose native objects to a single-threaded embedding host.
//!
//! Background threads reach the host through [`Remote::dispatch`]; native
//! handles become host proxies through [`wrapper::create`]; producers
//! broadcast to host-side consumers through [`Stream`].

pub mod runtime;

pub use runtime::config::RuntimeConfig;
pub use runtime::context::{ContextKey, ContextRegistry, Remote};
pub use runtime::counter::Counter;
pub use runtime::dispatcher::{Dispatcher, Task};
pub use runtime::error::{Error, ErrorKind, HostError, Result};
pub use runtime::host::{Env, Host};
pub use runtime::identity::{Core, CoreId};
pub use runtime::relay::Relay;
pub use runtime::stream::{FnSink, Sink, Stream, StreamId, StreamState, Subscriber, SubscriberId};
pub use runtime::value::{External, Function, HostObject, IterStep, Object, Value, WeakObject};
pub use runtime::wrapper::{ClassBuilder, Instance, Local, Wrapper};
pub use runtime::wrapper;
