//! The coordination server: lock table, client sessions and the actor loop.

pub mod actor;
pub mod session;
pub mod state;

pub use actor::LockServer;
pub use session::SessionManager;
pub use state::LockTable;
