//! Relay: a stream sink that hands each item to the host thread.
//!
//! Delivery under the stream lock is just an enqueue; the handler runs later
//! on the host thread during a drain. Items pushed after the context has
//! torn down are dropped.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use super::context::Remote;
use super::host::Env;
use super::stream::Sink;

type ClosedFn = dyn Fn(&Env, Option<&str>) + Send + Sync;

pub struct Relay<T, F> {
    remote: Remote,
    handler: Arc<F>,
    on_closed: Option<Arc<ClosedFn>>,
    _item: PhantomData<fn(T)>,
}

impl<T, F> Relay<T, F>
where
    T: Send + 'static,
    F: Fn(&Env, T) + Send + Sync + 'static,
{
    pub fn new(remote: Remote, handler: F) -> Self {
        Self {
            remote,
            handler: Arc::new(handler),
            on_closed: None,
            _item: PhantomData,
        }
    }

    /// Also run `f` on the host thread when the subscription ends.
    pub fn on_closed(mut self, f: impl Fn(&Env, Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }
}

impl<T, F> Sink<T> for Relay<T, F>
where
    T: Send + 'static,
    F: Fn(&Env, T) + Send + Sync + 'static,
{
    fn push(&self, item: T) {
        let handler = Arc::clone(&self.handler);
        if let Err(err) = self.remote.dispatch(move |env| handler(env, item)) {
            debug!(context = %self.remote.key(), %err, "relay dropped item");
        }
    }

    fn closed(&self, error: Option<&str>) {
        let Some(on_closed) = self.on_closed.clone() else {
            return;
        };
        let error = error.map(str::to_owned);
        if let Err(err) = self
            .remote
            .dispatch(move |env| on_closed(env, error.as_deref()))
        {
            debug!(context = %self.remote.key(), %err, "relay dropped close notification");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::runtime::context::ContextRegistry;
    use crate::runtime::host::Host;
    use crate::runtime::stream::{Stream, Subscriber};
    use crate::runtime::value::Value;

    #[test]
    fn items_arrive_on_host_thread_in_push_order() {
        let host = Host::open(&ContextRegistry::new()).unwrap();
        let stream = Stream::<u32>::new();
        let relay = Relay::new(host.remote(), |env: &Env, item: u32| {
            let sum = env.global("sum").and_then(|v| v.as_number()).unwrap_or(0.0);
            env.set_global("sum", Value::from(sum * 10.0 + item as f64));
        })
        .on_closed(|env, error| {
            env.set_global("closed", Value::from(error.unwrap_or("clean")));
        });
        let _subscriber = Subscriber::join(&stream, relay).unwrap();

        let producer = {
            let stream = stream.clone();
            std::thread::spawn(move || {
                for i in 1..=3 {
                    stream.push(i);
                }
                stream.crash("producer failed");
            })
        };
        producer.join().unwrap();

        assert_eq!(host.drain(), 4);
        assert_eq!(host.global("sum").and_then(|v| v.as_number()), Some(123.0));
        assert_eq!(
            host.global("closed").and_then(|v| v.as_str().map(str::to_owned)),
            Some("producer failed".to_string())
        );
    }

    #[test]
    fn pushes_after_teardown_are_dropped() {
        let host = Host::open(&ContextRegistry::new()).unwrap();
        let stream = Stream::<u32>::new();
        let _subscriber = Subscriber::join(&stream, Relay::new(host.remote(), |_: &Env, _: u32| {})).unwrap();
        drop(host);
        assert_eq!(stream.push(1), 1);
    }
}
