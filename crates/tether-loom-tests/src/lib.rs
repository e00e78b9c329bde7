//! Loom tests for the tether dispatcher and stream primitives.
//!
//! With `--cfg loom`, tether-host builds its dispatcher queue, context table
//! and stream membership on loom's mutex, so these models explore the real
//! code under every interleaving.
//!
//! Run with:
//! ```sh
//! RUSTFLAGS="--cfg loom" cargo test -p tether-loom-tests --release
//! ```
//!
//! For faster iteration with bounded preemptions:
//! ```sh
//! LOOM_MAX_PREEMPTIONS=2 RUSTFLAGS="--cfg loom" cargo test -p tether-loom-tests --release
//! ```

#[cfg(loom)]
mod tests {
    use loom::sync::atomic::{AtomicUsize, Ordering};
    use loom::sync::{Arc, Mutex};
    use loom::thread;

    use tether_host::{ContextRegistry, ErrorKind, FnSink, Host, Sink, Stream, StreamState, Subscriber};

    // =========================================================================
    // Dispatcher
    // =========================================================================

    #[test]
    fn dispatch_preserves_per_producer_order() {
        loom::model(|| {
            let host = Host::open(&ContextRegistry::new()).unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));

            let producers: Vec<_> = [0u32, 10]
                .into_iter()
                .map(|base| {
                    let remote = host.remote();
                    let log = Arc::clone(&log);
                    thread::spawn(move || {
                        for offset in 0..2 {
                            let log = Arc::clone(&log);
                            remote
                                .dispatch(move |_| log.lock().unwrap().push(base + offset))
                                .unwrap();
                        }
                    })
                })
                .collect();

            // Drain while producers are still enqueueing.
            let mut ran = host.drain();
            for producer in producers {
                producer.join().unwrap();
            }
            ran += host.drain();
            assert_eq!(ran, 4);

            let log = log.lock().unwrap();
            let position = |v: u32| log.iter().position(|x| *x == v).unwrap();
            assert!(position(0) < position(1));
            assert!(position(10) < position(11));

            let dispatcher = host.dispatcher().unwrap();
            assert!(!dispatcher.is_referenced());
            assert!(!host.is_alive());
        });
    }

    #[test]
    fn referenced_matches_outstanding_work() {
        loom::model(|| {
            let host = Host::open(&ContextRegistry::new()).unwrap();
            let remote = host.remote();

            let producer = thread::spawn(move || {
                remote.dispatch(|_| {}).unwrap();
            });
            let early = host.drain();
            producer.join().unwrap();

            let dispatcher = host.dispatcher().unwrap();
            if early == 1 {
                assert!(!dispatcher.is_referenced());
            } else {
                assert_eq!(dispatcher.pending(), 1);
                assert!(dispatcher.is_referenced());
                assert_eq!(host.drain(), 1);
                assert!(!dispatcher.is_referenced());
            }
        });
    }

    #[test]
    fn teardown_races_with_dispatch() {
        loom::model(|| {
            let registry = ContextRegistry::new();
            let host = Host::open(&registry).unwrap();
            let remote = host.remote();
            let dispatcher = host.dispatcher().unwrap();
            let ran = Arc::new(AtomicUsize::new(0));

            let producer = {
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    let result = remote.dispatch(move |_| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                    if let Err(err) = result {
                        assert_eq!(err.kind(), ErrorKind::NotInitialized);
                    }
                })
            };
            registry.teardown(host.key());
            producer.join().unwrap();

            assert_eq!(host.drain(), 0);
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            assert!(!dispatcher.is_active());
            assert_eq!(dispatcher.pending(), 0);
            assert!(!dispatcher.is_referenced());
            assert!(!host.is_alive());
        });
    }

    // =========================================================================
    // Stream
    // =========================================================================

    struct CountCloses(Arc<AtomicUsize>);

    impl Sink<u32> for CountCloses {
        fn push(&self, _item: u32) {}

        fn closed(&self, _error: Option<&str>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn crash_races_with_leave() {
        loom::model(|| {
            let fired = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            let stream = {
                let fired = Arc::clone(&fired);
                Stream::<u32>::with_on_close(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            };
            let subscriber =
                Subscriber::join(&stream, CountCloses(Arc::clone(&closes))).unwrap();

            let crasher = {
                let stream = stream.clone();
                thread::spawn(move || stream.crash("boom"))
            };
            subscriber.close();
            crasher.join().unwrap();

            assert_eq!(stream.state(), StreamState::Closed);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(closes.load(Ordering::SeqCst), 1);
            assert!(!subscriber.is_joined());
        });
    }

    #[test]
    fn join_races_with_close() {
        loom::model(|| {
            let stream = Stream::<u32>::new();
            let joiner = {
                let stream = stream.clone();
                thread::spawn(move || {
                    match Subscriber::join(&stream, FnSink(|_: u32| {})) {
                        Ok(subscriber) => {
                            let joined = subscriber.is_joined();
                            drop(subscriber);
                            Some(joined)
                        }
                        Err(err) => {
                            assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
                            None
                        }
                    }
                })
            };
            stream.close();
            let _ = joiner.join().unwrap();

            assert!(stream.is_closed());
            assert_eq!(stream.subscriber_count(), 0);
        });
    }

    #[test]
    fn push_never_delivers_after_close_returns() {
        loom::model(|| {
            let stream = Stream::<u32>::new();
            let delivered = Arc::new(AtomicUsize::new(0));
            let closed = Arc::new(AtomicUsize::new(0));

            let sink_delivered = Arc::clone(&delivered);
            let sink_closed = Arc::clone(&closed);
            let _subscriber = Subscriber::join(
                &stream,
                FnSink(move |_: u32| {
                    assert_eq!(sink_closed.load(Ordering::SeqCst), 0);
                    sink_delivered.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

            let producer = {
                let stream = stream.clone();
                thread::spawn(move || stream.push(1))
            };
            stream.close();
            closed.store(1, Ordering::SeqCst);
            let count = producer.join().unwrap();

            assert_eq!(delivered.load(Ordering::SeqCst), count);
            assert!(count <= 1);
        });
    }
}

#[cfg(not(loom))]
pub fn placeholder() {}
