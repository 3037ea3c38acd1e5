//! The versioned session state store and its per-session lock.
//!
//! `StateStore` is the port spec §4.4 describes: load/save/list/delete/
//! cleanup over `SessionState`, with every successful save bumping
//! `version` by exactly one. `SessionLockMap` is the concurrency primitive
//! that makes read-modify-write safe: the executor acquires a session's
//! lock for the whole `execute` call (see §5) before it ever reads state.

pub mod session_lock;
pub mod store;

pub use session_lock::{SessionBusy, SessionLockMap};
pub use store::{FileStateStore, InMemoryStateStore, StateStore};
