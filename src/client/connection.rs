//! Transport plumbing for the coordination client.
//!
//! The wire protocol has no reply correlation, so exactly one request is in
//! flight per connection; callers that need concurrency check out separate
//! connections from the pool in [`crate::client`].

use rand::Rng;
use std::io;
use std::process::Stdio;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::info;

use crate::config::CoordConfig;
use crate::net::framing::{read_message, write_message};
use crate::net::protocol::{Reply, Request, DEFAULT_MAX_MESSAGE_BYTES};

/// Reconnect backoff cap. Also the window a freshly spawned local server
/// daemon gets to come up.
pub const RECONNECT_CAP: Duration = Duration::from_secs(15);

const BACKOFF_BASE_MS: u64 = 250;

/// One TCP connection to the coordination server.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub async fn dial(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one request and wait for its reply.
    ///
    /// A reply the codec cannot parse surfaces as `InvalidData`; the
    /// connection must be discarded afterwards.
    pub async fn request(&mut self, request: &Request) -> io::Result<Reply> {
        write_message(&mut self.stream, &request.to_frames()).await?;
        let frames = read_message(&mut self.stream, DEFAULT_MAX_MESSAGE_BYTES).await?;
        Reply::from_frames(&frames)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Exponential backoff with jitter, capped at [`RECONNECT_CAP`].
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << self.attempt.min(10));
        let capped = exp.min(RECONNECT_CAP.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the configured server host is this machine.
pub fn host_is_local(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    hostname::get()
        .map(|h| h.to_string_lossy().eq_ignore_ascii_case(host))
        .unwrap_or(false)
}

/// Start a detached local coordination server daemon.
///
/// Used exactly once per process when the configured host is local and
/// nothing answers there. The daemon binary must be on `PATH`.
pub fn spawn_local_server(config: &CoordConfig) -> io::Result<()> {
    info!(
        port = config.server.port,
        "no local coordination server answering, spawning one"
    );
    std::process::Command::new("lab_coord")
        .arg("serve")
        .arg("--port")
        .arg(config.server.port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_millis(250));
        assert!(second >= Duration::from_millis(500));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            // cap plus at most 25% jitter
            assert!(delay <= RECONNECT_CAP + RECONNECT_CAP / 4);
        }
    }

    #[test]
    fn test_loopback_hosts_are_local() {
        assert!(host_is_local("localhost"));
        assert!(host_is_local("127.0.0.1"));
        assert!(!host_is_local("control-pc.lab.example"));
    }
}
