#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Fast-KV boundary for the delivery pipeline.
//!
//! Everything high-frequency and ephemeral lives behind [`KvStore`]:
//! rate-limit counters, throttle counters, agent decision caches, and the
//! cross-process distributed lock. The single primitive every limiter is
//! built on is [`KvStore::check_and_increment`]: an atomic, all-or-nothing
//! multi-counter step executed server-side, never as a client-side
//! read-modify-write.

pub mod backends;
pub mod error;
pub mod kv;
pub mod lock;

pub use backends::{memory::MemoryKv, redis::RedisKv};
pub use error::KvError;
pub use kv::{CounterOutcome, CounterSpec, KvStore, get_json, put_json};
pub use lock::{AdvisoryLocker, LockHandle, LockManager};
