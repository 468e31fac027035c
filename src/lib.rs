//! # Laboratory Coordination Core
//!
//! This crate is the multi-process coordination core of a distributed
//! laboratory-control suite. Experiment runners, analysis tools and
//! acquisition daemons on several hosts all write to the same HDF5 files on
//! shared storage; this library serializes that access with a cooperative,
//! network-based advisory lock service, and guards a few adjacent process
//! hazards (termination signals mid-write, double-imported script modules).
//!
//! ## Crate Structure
//!
//! - **`net`**: the wire codec — framed messages, request/reply types.
//! - **`server`**: the coordination server: lock table with reader batching
//!   and writer preference, client sessions, and the single-threaded actor
//!   loop that owns all state.
//! - **`client`**: the per-process client: connect and retry, heartbeats,
//!   `acquire`/`release` with re-entrancy accounting, and the `LockGuard`
//!   handle.
//! - **`file_access`**: transparent lock-then-open wrapper around
//!   `hdf5::File` (feature `storage_hdf5`).
//! - **`kill_guard`**: process-wide deferral of termination signals while
//!   locks or files are held.
//! - **`import_guard`**: a Rhai module resolver that refuses to load the
//!   same script file under two logical names.
//! - **`path_map`**: translation between per-host paths and the
//!   host-agnostic form used as lock keys.
//! - **`config`**: TOML + environment configuration via figment.
//! - **`error`**: the `CoordError` enum for centralized error handling.
//! - **`tracing_setup`**: logging initialization.

pub mod client;
pub mod config;
pub mod error;
pub mod import_guard;
pub mod kill_guard;
pub mod net;
pub mod path_map;
pub mod server;
pub mod tracing_setup;

#[cfg(feature = "storage_hdf5")]
pub mod file_access;

pub use client::{CoordClient, LockGuard};
pub use config::CoordConfig;
pub use error::{CoordError, CoordResult};
pub use net::protocol::LockMode;
pub use path_map::{LockKey, PathMap};
pub use server::LockServer;
