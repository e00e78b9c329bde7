//! Stream tests: producer threads against host-side subscribers.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_host::{
    ContextRegistry, Env, ErrorKind, FnSink, Host, Relay, Sink, Stream, StreamState, Subscriber,
    Value,
};

struct Collect {
    items: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl Sink<String> for Collect {
    fn push(&self, item: String) {
        self.items.lock().unwrap().push(item);
    }

    fn closed(&self, _error: Option<&str>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_state_machine_and_single_callback() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let stream = Stream::<String>::with_on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(stream.state(), StreamState::Pending);

    let items = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::join(
        &stream,
        Collect {
            items: Arc::clone(&items),
            closes: Arc::clone(&closes),
        },
    )
    .unwrap();
    assert_eq!(stream.state(), StreamState::Active);

    stream.push("hello".to_string());
    drop(subscriber);

    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(*items.lock().unwrap(), vec!["hello".to_string()]);

    stream.close();
    stream.crash("late");
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_crash_with_three_subscribers() {
    let stream = Stream::<String>::new();
    let subscribers: Vec<_> = (0..3)
        .map(|_| Subscriber::join(&stream, FnSink(|_: String| {})).unwrap())
        .collect();

    stream.crash("boom");
    assert_eq!(stream.state(), StreamState::Closed);
    for subscriber in &subscribers {
        assert!(subscriber.is_errored());
        assert_eq!(subscriber.what(), "boom");
    }

    let err = Subscriber::join(&stream, FnSink(|_: String| {})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
}

#[test]
fn test_producer_thread_relays_into_host() {
    let host = Host::open(&ContextRegistry::new()).unwrap();
    let stream = Stream::<u64>::new();
    let subscriber = Subscriber::join(
        &stream,
        Relay::new(host.remote(), |env: &Env, value: u64| {
            let total = env.global("total").and_then(|v| v.as_number()).unwrap_or(0.0);
            env.set_global("total", Value::from(total + value as f64));
        }),
    )
    .unwrap();

    let producer = {
        let stream = stream.clone();
        std::thread::spawn(move || {
            for value in 1..=100u64 {
                stream.push(value);
            }
            stream.close();
        })
    };

    let mut ran = 0;
    while ran < 100 {
        ran += host.turn(Duration::from_millis(50));
    }
    producer.join().unwrap();

    assert_eq!(host.global("total").and_then(|v| v.as_number()), Some(5050.0));
    assert!(!subscriber.is_joined());
    assert!(stream.is_closed());
}

#[test]
fn test_close_races_with_unsubscribe() {
    for _ in 0..50 {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let stream = Stream::<u32>::with_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let closes = Arc::new(AtomicUsize::new(0));
        let subscribers: Vec<_> = (0..4)
            .map(|_| {
                let closes = Arc::clone(&closes);
                Subscriber::join(&stream, CountCloses(closes)).unwrap()
            })
            .collect();

        let closer = {
            let stream = stream.clone();
            std::thread::spawn(move || stream.crash("racing"))
        };
        drop(subscribers);
        closer.join().unwrap();

        assert!(stream.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 4);
    }
}

struct CountCloses(Arc<AtomicUsize>);

impl Sink<u32> for CountCloses {
    fn push(&self, _item: u32) {}

    fn closed(&self, _error: Option<&str>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}
