//! The coordination server.
//!
//! One `LockServer` runs per cluster. Connection tasks only frame and
//! deframe messages; every request is forwarded over an mpsc channel to the
//! single actor loop that owns the [`LockTable`] and [`SessionManager`], so
//! all lock state is mutated on one task and the FIFO ordering rules hold
//! without any further synchronization.
//!
//! Lock state is memory-only. A server restart loses every grant, and
//! clients must treat outstanding locks as broken once they reconnect.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::CoordConfig;
use crate::error::CoordResult;
use crate::net::framing::{read_message, write_message};
use crate::net::protocol::{Reply, Request, DEFAULT_MAX_MESSAGE_BYTES, PROTOCOL_VERSION};
use crate::server::session::SessionManager;
use crate::server::state::LockTable;

/// How often waiter deadlines and session heartbeats are swept.
const SWEEP_INTERVAL_MS: u64 = 100;

/// Command channel depth between connection tasks and the actor.
const CMD_CHANNEL_CAPACITY: usize = 256;

enum ServerCmd {
    Request {
        conn_id: u64,
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    ConnClosed {
        conn_id: u64,
    },
}

/// The coordination server actor.
pub struct LockServer {
    listener: TcpListener,
    table: LockTable,
    sessions: SessionManager,
    cmd_tx: mpsc::Sender<ServerCmd>,
    cmd_rx: mpsc::Receiver<ServerCmd>,
    max_message_bytes: usize,
    next_conn_id: u64,
}

impl LockServer {
    /// Bind the server socket. Pass port 0 to pick an ephemeral port.
    pub async fn bind(addr: &str, config: &CoordConfig) -> CoordResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("coordination server listening on {}", listener.local_addr()?);

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        Ok(Self {
            listener,
            table: LockTable::new(),
            sessions: SessionManager::new(Duration::from_millis(config.timeouts.session_ms)),
            cmd_tx,
            cmd_rx,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            next_conn_id: 0,
        })
    }

    /// The bound address, for clients started against port 0.
    pub fn local_addr(&self) -> CoordResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept and state loop. Never returns under normal operation.
    pub async fn run(mut self) -> CoordResult<()> {
        let mut sweep = interval(Duration::from_millis(SWEEP_INTERVAL_MS));

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            self.next_conn_id += 1;
                            let conn_id = self.next_conn_id;
                            let cmd_tx = self.cmd_tx.clone();
                            let max_bytes = self.max_message_bytes;
                            tokio::spawn(async move {
                                handle_client(socket, addr, conn_id, cmd_tx, max_bytes).await;
                            });
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_cmd(cmd);
                }

                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn handle_cmd(&mut self, cmd: ServerCmd) {
        match cmd {
            ServerCmd::Request {
                conn_id,
                request,
                reply,
            } => {
                let now = Instant::now();
                if let Some(client_id) = client_id_of(&request) {
                    self.sessions.touch(client_id, conn_id, now);
                }

                match request {
                    Request::Acquire {
                        key,
                        client_id,
                        token,
                        mode,
                        timeout_ms,
                    } => {
                        debug!(%key, %client_id, %token, %mode, timeout_ms, "acquire");
                        self.table
                            .acquire(&key, &client_id, &token, mode, timeout_ms, now, reply);
                    }
                    Request::Release {
                        key,
                        client_id,
                        token,
                    } => {
                        let outcome = self.table.release(&key, &client_id, &token);
                        if outcome == Reply::NotHeld {
                            warn!(%key, %client_id, %token, "release of unheld lock");
                        }
                        let _ = reply.send(outcome);
                    }
                    Request::Cancel {
                        key,
                        client_id,
                        token,
                    } => {
                        debug!(%key, %client_id, %token, "cancel");
                        let _ = reply.send(self.table.cancel(&key, &client_id, &token));
                    }
                    Request::Ping { .. } => {
                        let _ = reply.send(Reply::Pong);
                    }
                    Request::ProtocolVersion => {
                        let _ = reply.send(Reply::Version(PROTOCOL_VERSION.to_string()));
                    }
                }
            }
            ServerCmd::ConnClosed { conn_id } => {
                for client_id in self.sessions.detach(conn_id) {
                    let (released, dropped) = self.table.drop_client(&client_id);
                    info!(
                        %client_id,
                        released, dropped, "session closed, state cleaned up"
                    );
                }
            }
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let expired = self.table.expire(now);
        if expired > 0 {
            debug!(expired, "acquire requests timed out");
        }
        for client_id in self.sessions.lapsed(now) {
            let (released, dropped) = self.table.drop_client(&client_id);
            warn!(
                %client_id,
                released, dropped, "session heartbeat lapsed, state cleaned up"
            );
        }
    }
}

fn client_id_of(request: &Request) -> Option<&str> {
    match request {
        Request::Acquire { client_id, .. }
        | Request::Release { client_id, .. }
        | Request::Cancel { client_id, .. } => Some(client_id),
        Request::Ping { client_id } => client_id.as_deref(),
        Request::ProtocolVersion => None,
    }
}

/// Per-connection task: frame messages in, forward to the actor, write the
/// reply back. One request is in flight per connection at a time; the reply
/// to a blocking acquire arrives whenever the actor grants, times out or
/// cancels it.
async fn handle_client(
    mut socket: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    cmd_tx: mpsc::Sender<ServerCmd>,
    max_bytes: usize,
) {
    debug!(%addr, conn_id, "client connected");

    loop {
        let frames = match read_message(&mut socket, max_bytes).await {
            Ok(frames) => frames,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(%addr, "dropping connection: {}", e);
                let _ = write_message(&mut socket, &Reply::Malformed.to_frames()).await;
                break;
            }
            Err(_) => break,
        };

        let request = match Request::from_frames(&frames) {
            Ok(request) => request,
            Err(e) => {
                warn!(%addr, "dropping connection: {}", e);
                let _ = write_message(&mut socket, &Reply::Malformed.to_frames()).await;
                break;
            }
        };

        let (tx, rx) = oneshot::channel();
        if cmd_tx
            .send(ServerCmd::Request {
                conn_id,
                request,
                reply: tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let Ok(reply) = rx.await else {
            break;
        };
        if let Err(e) = write_message(&mut socket, &reply.to_frames()).await {
            debug!(%addr, "write failed: {}", e);
            break;
        }
    }

    let _ = cmd_tx.send(ServerCmd::ConnClosed { conn_id }).await;
    debug!(%addr, conn_id, "client disconnected");
}
