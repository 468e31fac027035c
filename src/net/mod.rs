//! Wire protocol for the coordination server.

pub mod framing;
pub mod protocol;

pub use framing::{read_message, write_message};
pub use protocol::{LockMode, Reply, Request, DEFAULT_MAX_MESSAGE_BYTES, PROTOCOL_VERSION};
