//! Stream: thread-safe broadcast from native producers to subscribers.
//!
//! State machine:
//!   PENDING --join(first)--> ACTIVE --leave(last) | close | crash--> CLOSED
//!
//! Membership lives in the stream, keyed by `SubscriberId`. A subscriber
//! holds only a tagged, non-owning link (`Joined` → `Detached`, once).
//!
//! Lock order is stream → link. A subscriber releases its link lock before
//! calling back into the stream, so the two paths never hold both in
//! opposite order.
//!
//! `push` delivers while holding the stream lock. A sink must not join,
//! leave or close the stream it is being fed from.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::trace;

use super::error::{Error, Result};
use super::sync::{lock, Mutex};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

const NO_ERROR: &str = "No error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Active,
    Closed,
}

/// Receiving end of a subscription.
pub trait Sink<T>: Send + Sync {
    /// Called under the stream lock for every pushed item.
    fn push(&self, item: T);

    /// Called exactly once when the subscription ends, with the crash
    /// message if the stream crashed.
    fn closed(&self, _error: Option<&str>) {}
}

/// Adapts a closure into a [`Sink`].
pub struct FnSink<F>(pub F);

impl<T, F> Sink<T> for FnSink<F>
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn push(&self, item: T) {
        (self.0)(item)
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

// =============================================================================
// Membership: shared between a Subscriber and the stream's member table
// =============================================================================

enum Link<T> {
    Joined { stream: StreamId, shared: Weak<Shared<T>> },
    Detached,
}

struct Membership<T> {
    id: SubscriberId,
    sink: Box<dyn Sink<T>>,
    link: Mutex<Link<T>>,
    error: OnceLock<Arc<str>>,
    notified: AtomicBool,
}

impl<T> Membership<T> {
    fn sever(&self) -> Link<T> {
        std::mem::replace(&mut *lock(&self.link), Link::Detached)
    }

    fn finish(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            self.sink.closed(self.error.get().map(|e| &**e));
        }
    }
}

// =============================================================================
// Stream
// =============================================================================

struct Inner<T> {
    state: StreamState,
    members: BTreeMap<SubscriberId, Arc<Membership<T>>>,
    on_close: Option<CloseCallback>,
}

struct Shared<T> {
    id: StreamId,
    inner: Mutex<Inner<T>>,
}

impl<T> Shared<T> {
    /// Move to CLOSED, sever and notify every member, fire the callback.
    fn terminate(&self, error: Option<Arc<str>>) {
        let (members, callback, severed) = {
            let mut inner = lock(&self.inner);
            if inner.state == StreamState::Closed {
                return;
            }
            let members = std::mem::take(&mut inner.members);
            if let Some(error) = &error {
                for member in members.values() {
                    let _ = member.error.set(Arc::clone(error));
                }
            }
            let severed: Vec<Link<T>> = members.values().map(|m| m.sever()).collect();
            inner.state = StreamState::Closed;
            (members, inner.on_close.take(), severed)
        };
        drop(severed);

        trace!(stream = %self.id, subscribers = members.len(), crashed = error.is_some(), "stream closed");
        for member in members.values() {
            member.finish();
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    fn leave(&self, id: SubscriberId) {
        let callback = {
            let mut inner = lock(&self.inner);
            if inner.members.remove(&id).is_none() {
                return;
            }
            if inner.members.is_empty() && inner.state != StreamState::Closed {
                inner.state = StreamState::Closed;
                trace!(stream = %self.id, "last subscriber left");
                inner.on_close.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.terminate(None);
    }
}

/// Producer handle. Clones share the stream; dropping the last one closes it.
pub struct Stream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Stream<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)),
                inner: Mutex::new(Inner {
                    state: StreamState::Pending,
                    members: BTreeMap::new(),
                    on_close: None,
                }),
            }),
        }
    }

    /// Stream whose close callback is `on_close`.
    pub fn with_on_close(on_close: impl FnOnce() + Send + 'static) -> Self {
        let stream = Self::new();
        stream.set_on_close(on_close);
        stream
    }

    /// Replace the close callback. Ignored once the stream is closed.
    pub fn set_on_close(&self, on_close: impl FnOnce() + Send + 'static) {
        let mut inner = lock(&self.shared.inner);
        if inner.state != StreamState::Closed {
            inner.on_close = Some(Box::new(on_close));
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        lock(&self.shared.inner).state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.inner).members.len()
    }

    /// Deliver `item` to every joined subscriber. Returns the delivery count.
    pub fn push(&self, item: T) -> usize
    where
        T: Clone,
    {
        let inner = lock(&self.shared.inner);
        if inner.state != StreamState::Active {
            return 0;
        }
        for member in inner.members.values() {
            member.sink.push(item.clone());
        }
        inner.members.len()
    }

    pub fn close(&self) {
        self.shared.terminate(None);
    }

    /// Close, stamping `message` into every subscriber's error slot first.
    pub fn crash(&self, message: impl Into<String>) {
        let message: Arc<str> = Arc::from(message.into());
        self.shared.terminate(Some(message));
    }

    fn join(&self, member: &Arc<Membership<T>>) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        if inner.state == StreamState::Closed {
            return Err(Error::AlreadyClosed);
        }
        *lock(&member.link) = Link::Joined {
            stream: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        };
        inner.members.insert(member.id, Arc::clone(member));
        inner.state = StreamState::Active;
        Ok(())
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.shared.inner);
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("subscribers", &inner.members.len())
            .finish()
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// One subscription. Dropping it leaves the stream.
pub struct Subscriber<T> {
    member: Arc<Membership<T>>,
}

impl<T: Send + 'static> Subscriber<T> {
    /// Join `stream` when given one; otherwise start detached.
    pub fn new(stream: Option<&Stream<T>>, sink: impl Sink<T> + 'static) -> Result<Self> {
        let subscriber = Self {
            member: Arc::new(Membership {
                id: SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)),
                sink: Box::new(sink),
                link: Mutex::new(Link::Detached),
                error: OnceLock::new(),
                notified: AtomicBool::new(false),
            }),
        };
        if let Some(stream) = stream {
            if let Err(err) = stream.join(&subscriber.member) {
                // Never reached the member table: drop the sink without `closed`.
                subscriber.member.notified.store(true, Ordering::Release);
                return Err(err);
            }
            trace!(stream = %stream.id(), subscriber = %subscriber.member.id, "joined");
        }
        Ok(subscriber)
    }

    pub fn join(stream: &Stream<T>, sink: impl Sink<T> + 'static) -> Result<Self> {
        Self::new(Some(stream), sink)
    }
}

impl<T> Subscriber<T> {
    pub fn id(&self) -> SubscriberId {
        self.member.id
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match &*lock(&self.member.link) {
            Link::Joined { stream, .. } => Some(*stream),
            Link::Detached => None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.stream_id().is_some()
    }

    /// Joined and not errored.
    pub fn is_active(&self) -> bool {
        self.is_joined() && !self.is_errored()
    }

    pub fn is_errored(&self) -> bool {
        self.member.error.get().is_some()
    }

    pub fn error(&self) -> Option<Arc<str>> {
        self.member.error.get().cloned()
    }

    /// Error text, or `"No error"`.
    pub fn what(&self) -> &str {
        self.member.error.get().map(|e| &**e).unwrap_or(NO_ERROR)
    }

    /// Leave the stream. Idempotent.
    pub fn close(&self) {
        let link = self.member.sever();
        if let Link::Joined { stream, shared } = link {
            if let Some(shared) = shared.upgrade() {
                shared.leave(self.member.id);
            }
            trace!(stream = %stream, subscriber = %self.member.id, "left");
        }
        self.member.finish();
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.member.id)
            .field("stream", &self.stream_id())
            .field("error", &self.member.error.get())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::runtime::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Record {
        items: StdMutex<Vec<u32>>,
        closed: StdMutex<Vec<Option<String>>>,
    }

    struct Recorder(Arc<Record>);

    impl Sink<u32> for Recorder {
        fn push(&self, item: u32) {
            self.0.items.lock().unwrap().push(item);
        }

        fn closed(&self, error: Option<&str>) {
            self.0.closed.lock().unwrap().push(error.map(str::to_owned));
        }
    }

    fn recorder() -> (Arc<Record>, Recorder) {
        let record = Arc::new(Record::default());
        (Arc::clone(&record), Recorder(record))
    }

    fn counting_stream() -> (Stream<u32>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let stream = Stream::with_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (stream, fired)
    }

    #[test]
    fn lifecycle_pending_active_closed() {
        let (stream, fired) = counting_stream();
        assert_eq!(stream.state(), StreamState::Pending);
        assert_eq!(stream.push(1), 0);

        let (_, sink_a) = recorder();
        let (_, sink_b) = recorder();
        let a = Subscriber::join(&stream, sink_a).unwrap();
        assert_eq!(stream.state(), StreamState::Active);
        let b = Subscriber::join(&stream, sink_b).unwrap();
        assert_eq!(stream.subscriber_count(), 2);

        drop(a);
        assert_eq!(stream.state(), StreamState::Active);
        b.close();
        b.close();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(b);
        stream.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_reaches_every_subscriber_in_order() {
        let stream = Stream::new();
        let (rec_a, sink_a) = recorder();
        let (rec_b, sink_b) = recorder();
        let _a = Subscriber::join(&stream, sink_a).unwrap();
        let _b = Subscriber::join(&stream, sink_b).unwrap();

        for i in 0..5 {
            assert_eq!(stream.push(i), 2);
        }
        assert_eq!(*rec_a.items.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*rec_b.items.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn crash_stamps_every_subscriber() {
        let (stream, fired) = counting_stream();
        let mut records = Vec::new();
        let mut subscribers = Vec::new();
        for _ in 0..3 {
            let (record, sink) = recorder();
            records.push(record);
            subscribers.push(Subscriber::join(&stream, sink).unwrap());
        }

        stream.crash("boom");
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        for (subscriber, record) in subscribers.iter().zip(&records) {
            assert!(subscriber.is_errored());
            assert!(!subscriber.is_active());
            assert!(!subscriber.is_joined());
            assert_eq!(subscriber.what(), "boom");
            assert_eq!(subscriber.error().as_deref(), Some("boom"));
            assert_eq!(*record.closed.lock().unwrap(), vec![Some("boom".to_string())]);
        }
        assert_eq!(stream.push(9), 0);

        let (_, late) = recorder();
        let err = Subscriber::join(&stream, late).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);

        // Dropping severed subscribers neither re-fires nor re-notifies.
        drop(subscribers);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        for record in &records {
            assert_eq!(record.closed.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn close_detaches_without_error() {
        let stream = Stream::new();
        let (record, sink) = recorder();
        let subscriber = Subscriber::join(&stream, sink).unwrap();
        assert_eq!(subscriber.stream_id(), Some(stream.id()));
        assert_eq!(subscriber.what(), "No error");

        stream.close();
        assert!(!subscriber.is_joined());
        assert!(!subscriber.is_errored());
        assert_eq!(*record.closed.lock().unwrap(), vec![None]);
    }

    #[test]
    fn detached_subscriber() {
        let (record, sink) = recorder();
        let subscriber = Subscriber::<u32>::new(None, sink).unwrap();
        assert!(!subscriber.is_joined());
        drop(subscriber);
        assert_eq!(*record.closed.lock().unwrap(), vec![None]);
    }

    #[test]
    fn failed_join_does_not_notify() {
        let stream = Stream::<u32>::new();
        stream.close();
        let (record, sink) = recorder();
        assert!(Subscriber::join(&stream, sink).is_err());
        assert!(record.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn close_racing_join_still_notifies_joined_sink() {
        for _ in 0..200 {
            let stream = Stream::<u32>::new();
            let (record, sink) = recorder();
            let closer = {
                let stream = stream.clone();
                std::thread::spawn(move || stream.close())
            };
            let joined = Subscriber::join(&stream, sink);
            closer.join().unwrap();

            // Either the join lost the race, or the live subscriber was told.
            match joined {
                Ok(subscriber) => {
                    assert!(!subscriber.is_joined());
                    assert_eq!(*record.closed.lock().unwrap(), vec![None]);
                }
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
                    assert!(record.closed.lock().unwrap().is_empty());
                }
            }
        }
    }

    #[test]
    fn dropping_last_producer_handle_closes() {
        let (stream, fired) = counting_stream();
        let (record, sink) = recorder();
        let subscriber = Subscriber::join(&stream, sink).unwrap();

        drop(stream);
        assert!(!subscriber.is_joined());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(record.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_producers_and_churn() {
        let stream = Stream::new();
        let total = Arc::new(AtomicUsize::new(0));
        let sink_total = Arc::clone(&total);
        let keeper = Subscriber::join(
            &stream,
            FnSink(move |_: u32| {
                sink_total.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let stream = stream.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        stream.push(i);
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            let (_, sink) = recorder();
            drop(Subscriber::join(&stream, sink).unwrap());
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 1000);
        assert_eq!(stream.state(), StreamState::Active);
        drop(keeper);
        assert!(stream.is_closed());
    }
}
