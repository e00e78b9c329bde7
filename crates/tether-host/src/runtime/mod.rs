//! Runtime: the host context and the three primitives built on it.
//!
//! - `dispatcher` / `context`: cross-thread task queue per context, and the
//!   registry mapping context keys to dispatchers
//! - `wrapper` / `identity`: native handles bound to host proxies
//! - `stream` / `relay`: broadcast from native producers to subscribers
//!
//! CRITICAL: no lock or RefCell borrow is held while user code runs (tasks,
//! wrapper hooks, host functions). Every path follows
//!   borrow → extract → drop borrow → call → re-borrow

pub mod config;
pub mod context;
pub mod counter;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod host;
pub mod identity;
pub mod logging;
pub mod relay;
pub mod stream;
mod sync;
pub mod value;
pub mod wrapper;
