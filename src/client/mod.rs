//! The coordination client.
//!
//! `CoordClient` is the per-process library side of the lock protocol:
//! connect and retry, heartbeat, acquire and release with re-entrancy
//! accounting, timeout enforcement. Callers receive a [`LockGuard`] that
//! releases exactly once, either explicitly via [`LockGuard::release`] or
//! from `Drop` through a background task (dropping never blocks).
//!
//! The client is synchronous in spirit: `acquire` returns once the server
//! has granted the lock. Internally a worker task drains drop-releases and
//! keeps the session alive with heartbeats; it is not part of the public
//! contract.
//!
//! While any lock is held the process holds a [`KillGuard`] handle, so a
//! termination signal cannot interrupt a write in progress; it is deferred
//! until the last lock is released.

mod connection;

pub use connection::Connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::kill_guard::{KillGuard, KillGuardHandle};
use crate::net::protocol::{LockMode, Reply, Request};
use crate::path_map::LockKey;
use connection::{host_is_local, spawn_local_server, Backoff, RECONNECT_CAP};

/// Protocol version from which shared (read) locks exist.
const MIN_SHARED_LOCK_VERSION: (u64, u64, u64) = (1, 1, 0);

/// Extra slack on top of the requested acquire window before the client
/// gives up locally; the server clock is authoritative for the timeout
/// itself.
const LOCAL_DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Budget for a release round-trip; a release never waits on other clients.
const RELEASE_BUDGET: Duration = Duration::from_secs(10);

const HEARTBEAT_BUDGET: Duration = Duration::from_secs(5);

/// Connections kept warm in the pool.
const POOL_MAX: usize = 8;

enum BgOp {
    Release { key: String, token: String },
    Cancel { key: String, token: String },
}

struct HeldEntry {
    mode: LockMode,
    count: u32,
}

struct ClientInner {
    config: CoordConfig,
    addr: String,
    client_id: String,
    pool: Mutex<Vec<Connection>>,
    held: Mutex<HashMap<String, HeldEntry>>,
    ops_tx: mpsc::UnboundedSender<BgOp>,
    read_write_supported: AtomicBool,
    spawned_server: AtomicBool,
}

/// Client handle to the coordination server. Cheap to clone; all clones
/// share one session (`client_id`), pool and heartbeat.
#[derive(Clone)]
pub struct CoordClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for CoordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = lock_poisonless(&self.inner.held);
        f.debug_struct("CoordClient")
            .field("client_id", &self.inner.client_id)
            .field("addr", &self.inner.addr)
            .field("held_keys", &held.len())
            .finish()
    }
}

impl CoordClient {
    /// Connect to the configured coordination server and verify protocol
    /// compatibility.
    ///
    /// If the configured host is this machine and nothing answers, a server
    /// daemon is spawned once and the startup window extends to ~15 s.
    pub async fn connect(config: CoordConfig) -> CoordResult<Self> {
        config.check_security()?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let mut uuid = Uuid::new_v4().simple().to_string();
        uuid.truncate(8);
        let client_id = format!("{}-{}-{}", host, std::process::id(), uuid);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let addr = config.server_addr();
        let session_ms = config.timeouts.session_ms;
        let inner = Arc::new(ClientInner {
            config,
            addr,
            client_id,
            pool: Mutex::new(Vec::new()),
            held: Mutex::new(HashMap::new()),
            ops_tx,
            read_write_supported: AtomicBool::new(true),
            spawned_server: AtomicBool::new(false),
        });

        inner.handshake().await?;

        tokio::spawn(background_loop(Arc::downgrade(&inner), ops_rx, session_ms));

        Ok(Self { inner })
    }

    /// This process's session identity on the server.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Acquire with the configured default timeout.
    pub async fn acquire(&self, key: impl Into<LockKey>, mode: LockMode) -> CoordResult<LockGuard> {
        let timeout_ms = self.inner.config.timeouts.default_acquire_ms;
        self.acquire_with_timeout(key, mode, timeout_ms).await
    }

    /// Acquire `key` in `mode`, waiting server-side up to `timeout_ms`.
    ///
    /// `timeout_ms == 0` never blocks: the result is immediate or
    /// `would-block`.
    pub async fn acquire_with_timeout(
        &self,
        key: impl Into<LockKey>,
        mode: LockMode,
        timeout_ms: u64,
    ) -> CoordResult<LockGuard> {
        let key = key.into().into_string();

        // Pre-1.1 servers only speak exclusive locks; a write lock is a
        // correct (stronger) substitute for a read lock.
        let mode = if mode == LockMode::Read
            && !self.inner.read_write_supported.load(Ordering::Relaxed)
        {
            debug!(%key, "server predates shared locks, acquiring exclusive");
            LockMode::Write
        } else {
            mode
        };

        // Fail mode changes fast; the server would deny them anyway.
        {
            let held = lock_poisonless(&self.inner.held);
            if let Some(entry) = held.get(&key) {
                if entry.mode != mode {
                    return Err(CoordError::UpgradeDenied { key });
                }
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        let request = Request::Acquire {
            key: key.clone(),
            client_id: self.inner.client_id.clone(),
            token: token.clone(),
            mode,
            timeout_ms,
        };
        let deadline = Instant::now() + Duration::from_millis(timeout_ms) + LOCAL_DEADLINE_GRACE;

        // If this future is dropped while the request is outstanding, tell
        // the server to forget the token so no grant is leaked.
        let mut cancel_guard = CancelOnDrop {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            token: token.clone(),
            armed: true,
        };
        let reply = self.inner.call_with_retry(&request, deadline).await;
        cancel_guard.armed = matches!(reply, Err(_));
        drop(cancel_guard);

        match reply? {
            Reply::Ok => {
                self.inner.note_acquired(&key, mode);
                // The guard exists before the caller sees success, so a
                // termination signal can never slip between grant and use.
                let kill = KillGuard::acquire();
                debug!(%key, %token, %mode, "lock acquired");
                Ok(LockGuard {
                    inner: Arc::clone(&self.inner),
                    key,
                    token,
                    mode,
                    released: false,
                    kill: Some(kill),
                })
            }
            Reply::Timeout => Err(CoordError::Timeout { key, token }),
            Reply::WouldBlock => Err(CoordError::WouldBlock { key, token }),
            Reply::UpgradeDenied => Err(CoordError::UpgradeDenied { key }),
            other => Err(CoordError::Malformed(format!(
                "unexpected reply to acquire: {other:?}"
            ))),
        }
    }

    /// Round-trip a heartbeat. Mostly useful for tests and health checks;
    /// the background task pings on its own.
    pub async fn ping(&self) -> CoordResult<()> {
        let request = Request::Ping {
            client_id: Some(self.inner.client_id.clone()),
        };
        let deadline = Instant::now() + HEARTBEAT_BUDGET;
        match self.inner.call_with_retry(&request, deadline).await? {
            Reply::Pong => Ok(()),
            other => Err(CoordError::Malformed(format!(
                "unexpected reply to ping: {other:?}"
            ))),
        }
    }
}

impl ClientInner {
    /// First connection: dial (spawning a local daemon at most once), then
    /// check the protocol version.
    async fn handshake(&self) -> CoordResult<()> {
        let mut conn = self.initial_dial().await?;
        let reply = conn
            .request(&Request::ProtocolVersion)
            .await
            .map_err(|e| CoordError::ConnectionLost(e.to_string()))?;
        self.checkin(conn);

        let Reply::Version(version) = reply else {
            return Err(CoordError::Malformed(format!(
                "unexpected reply to protocol-version: {reply:?}"
            )));
        };
        let Some(parsed) = parse_version(&version) else {
            return Err(CoordError::IncompatibleProtocol {
                server: version,
                required: format!("{}.x", MIN_SHARED_LOCK_VERSION.0),
            });
        };
        if parsed.0 != MIN_SHARED_LOCK_VERSION.0 {
            return Err(CoordError::IncompatibleProtocol {
                server: version,
                required: format!("{}.x", MIN_SHARED_LOCK_VERSION.0),
            });
        }
        let shared_ok = parsed >= MIN_SHARED_LOCK_VERSION;
        self.read_write_supported.store(shared_ok, Ordering::Relaxed);
        info!(server_version = %version, shared_locks = shared_ok, "connected to coordination server");
        Ok(())
    }

    async fn initial_dial(&self) -> CoordResult<Connection> {
        match Connection::dial(&self.addr).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                debug!("initial dial failed: {}", e);
            }
        }

        let local = host_is_local(&self.config.server.host);
        let window = if local && !self.spawned_server.swap(true, Ordering::SeqCst) {
            if let Err(e) = spawn_local_server(&self.config) {
                warn!("could not spawn local coordination server: {}", e);
            }
            RECONNECT_CAP
        } else {
            Duration::from_secs(5)
        };

        let deadline = Instant::now() + window;
        let mut backoff = Backoff::new();
        loop {
            match Connection::dial(&self.addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    let delay = backoff.next_delay();
                    if Instant::now() + delay >= deadline {
                        return Err(CoordError::ConnectionLost(format!(
                            "could not reach {}: {}",
                            self.addr, e
                        )));
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    /// Perform one request, reconnecting with backoff until `deadline`.
    ///
    /// Retransmissions reuse the caller's request verbatim, token included,
    /// so the server can deduplicate and a retried acquire still maps to
    /// exactly one grant.
    async fn call_with_retry(&self, request: &Request, deadline: Instant) -> CoordResult<Reply> {
        let mut backoff = Backoff::new();
        let mut last_error = String::new();
        loop {
            match self.checkout().await {
                Ok(mut conn) => match conn.request(request).await {
                    Ok(reply) => {
                        if reply == Reply::Malformed {
                            return Err(CoordError::Malformed(
                                "server rejected the request as malformed".into(),
                            ));
                        }
                        self.checkin(conn);
                        return Ok(reply);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        return Err(CoordError::Malformed(e.to_string()));
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        debug!("request failed, will retry: {}", e);
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            let delay = backoff.next_delay();
            if Instant::now() + delay >= deadline {
                return Err(CoordError::ConnectionLost(last_error));
            }
            sleep(delay).await;
        }
    }

    async fn checkout(&self) -> std::io::Result<Connection> {
        if let Some(conn) = lock_poisonless(&self.pool).pop() {
            return Ok(conn);
        }
        Connection::dial(&self.addr).await
    }

    fn checkin(&self, conn: Connection) {
        let mut pool = lock_poisonless(&self.pool);
        if pool.len() < POOL_MAX {
            pool.push(conn);
        }
    }

    fn note_acquired(&self, key: &str, mode: LockMode) {
        let mut held = lock_poisonless(&self.held);
        held.entry(key.to_string())
            .and_modify(|e| e.count += 1)
            .or_insert(HeldEntry { mode, count: 1 });
    }

    fn note_released(&self, key: &str) {
        let mut held = lock_poisonless(&self.held);
        if let Some(entry) = held.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                held.remove(key);
            }
        }
    }
}

/// A held coordination lock. Releases exactly once: explicitly through
/// [`LockGuard::release`], or on drop via the client's background task.
#[must_use]
pub struct LockGuard {
    inner: Arc<ClientInner>,
    key: String,
    token: String,
    mode: LockMode,
    released: bool,
    kill: Option<KillGuardHandle>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Token of this grant, for log correlation with the server.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock and wait for the server's acknowledgement.
    pub async fn release(mut self) -> CoordResult<()> {
        self.released = true;
        let kill = self.kill.take();
        self.inner.note_released(&self.key);

        let request = Request::Release {
            key: self.key.clone(),
            client_id: self.inner.client_id.clone(),
            token: self.token.clone(),
        };
        let deadline = Instant::now() + RELEASE_BUDGET;
        let reply = self.inner.call_with_retry(&request, deadline).await;
        // Suppression ends only after the server knows the lock is free.
        drop(kill);

        match reply? {
            Reply::Ok => Ok(()),
            Reply::NotHeld => Err(CoordError::NotHeld {
                key: self.key.clone(),
                token: self.token.clone(),
            }),
            other => Err(CoordError::Malformed(format!(
                "unexpected reply to release: {other:?}"
            ))),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.note_released(&self.key);
            let _ = self.inner.ops_tx.send(BgOp::Release {
                key: self.key.clone(),
                token: self.token.clone(),
            });
            // The kill handle in self drops after this body, once the
            // release is already on its way.
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("token", &self.token)
            .finish()
    }
}

struct CancelOnDrop {
    inner: Arc<ClientInner>,
    key: String,
    token: String,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.inner.ops_tx.send(BgOp::Cancel {
                key: self.key.clone(),
                token: self.token.clone(),
            });
        }
    }
}

/// Worker task behind every client: drains drop-releases and cancels, and
/// heartbeats so the session outlives quiet periods while locks are held.
async fn background_loop(
    inner: Weak<ClientInner>,
    mut ops_rx: mpsc::UnboundedReceiver<BgOp>,
    session_ms: u64,
) {
    let mut ping = interval(Duration::from_millis((session_ms / 3).max(1_000)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            op = ops_rx.recv() => {
                let Some(op) = op else { break };
                let Some(inner) = inner.upgrade() else { break };
                match op {
                    BgOp::Release { key, token } => {
                        let request = Request::Release {
                            key: key.clone(),
                            client_id: inner.client_id.clone(),
                            token,
                        };
                        let deadline = Instant::now() + RELEASE_BUDGET;
                        if let Err(e) = inner.call_with_retry(&request, deadline).await {
                            // The server's session cleanup is the backstop.
                            warn!(%key, "drop-release failed: {}", e);
                        }
                    }
                    BgOp::Cancel { key, token } => {
                        let request = Request::Cancel {
                            key: key.clone(),
                            client_id: inner.client_id.clone(),
                            token,
                        };
                        let deadline = Instant::now() + HEARTBEAT_BUDGET;
                        if let Err(e) = inner.call_with_retry(&request, deadline).await {
                            debug!(%key, "cancel failed: {}", e);
                        }
                    }
                }
            }

            _ = ping.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let request = Request::Ping {
                    client_id: Some(inner.client_id.clone()),
                };
                let deadline = Instant::now() + HEARTBEAT_BUDGET;
                if let Err(e) = inner.call_with_retry(&request, deadline).await {
                    debug!("heartbeat failed: {}", e);
                }
            }
        }
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn lock_poisonless<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.1.0"), Some((1, 1, 0)));
        assert_eq!(parse_version("1.0.12"), Some((1, 0, 12)));
        assert_eq!(parse_version("2"), None);
        assert_eq!(parse_version("1.1.0.0"), None);
        assert_eq!(parse_version("one.two.three"), None);
    }

    #[test]
    fn test_shared_lock_version_ordering() {
        assert!(parse_version("1.1.0").unwrap() >= MIN_SHARED_LOCK_VERSION);
        assert!(parse_version("1.2.0").unwrap() >= MIN_SHARED_LOCK_VERSION);
        assert!(parse_version("1.0.9").unwrap() < MIN_SHARED_LOCK_VERSION);
    }
}
