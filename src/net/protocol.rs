//! Request and reply messages of the coordination protocol.
//!
//! A message is a sequence of opaque frames (see [`crate::net::framing`] for
//! the byte layout). The first frame of a request is an ASCII command word;
//! the remaining frames are positional parameters. Numeric parameters travel
//! as decimal ASCII, which keeps the protocol language-neutral and
//! inspectable on the wire. Replies are a single frame whose first token is
//! `ok`, `pong`, `version` or an error kind.

use std::fmt;

/// Version string answered to `protocol-version` requests.
///
/// Shared (read) locks exist since 1.1.0; older servers only speak
/// exclusive locks.
pub const PROTOCOL_VERSION: &str = "1.1.0";

/// Maximum accepted size of one encoded message, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Lock sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access; any number of readers may hold the key together.
    Read,
    /// Exclusive access; excludes all other grants on the key.
    Write,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(LockMode::Read),
            "write" => Some(LockMode::Write),
            _ => None,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Acquire a lock, blocking server-side up to `timeout_ms`.
    Acquire {
        key: String,
        client_id: String,
        token: String,
        mode: LockMode,
        timeout_ms: u64,
    },
    /// Release a previously granted lock token.
    Release {
        key: String,
        client_id: String,
        token: String,
    },
    /// Drop a queued acquire whose caller has given up on it.
    Cancel {
        key: String,
        client_id: String,
        token: String,
    },
    /// Heartbeat. The optional `client_id` refreshes that session.
    Ping { client_id: Option<String> },
    /// Ask the server for its protocol version.
    ProtocolVersion,
}

impl Request {
    /// Encode into wire frames.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match self {
            Request::Acquire {
                key,
                client_id,
                token,
                mode,
                timeout_ms,
            } => vec![
                b"acquire".to_vec(),
                key.as_bytes().to_vec(),
                client_id.as_bytes().to_vec(),
                token.as_bytes().to_vec(),
                mode.as_str().as_bytes().to_vec(),
                timeout_ms.to_string().into_bytes(),
            ],
            Request::Release {
                key,
                client_id,
                token,
            } => vec![
                b"release".to_vec(),
                key.as_bytes().to_vec(),
                client_id.as_bytes().to_vec(),
                token.as_bytes().to_vec(),
            ],
            Request::Cancel {
                key,
                client_id,
                token,
            } => vec![
                b"cancel".to_vec(),
                key.as_bytes().to_vec(),
                client_id.as_bytes().to_vec(),
                token.as_bytes().to_vec(),
            ],
            Request::Ping { client_id } => {
                let mut frames = vec![b"ping".to_vec()];
                if let Some(id) = client_id {
                    frames.push(id.as_bytes().to_vec());
                }
                frames
            }
            Request::ProtocolVersion => vec![b"protocol-version".to_vec()],
        }
    }

    /// Decode from wire frames.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, String> {
        let command = frames
            .first()
            .ok_or_else(|| "empty message".to_string())
            .and_then(|f| text(f))?;

        match command.as_str() {
            "acquire" => {
                let [key, client_id, token, mode, timeout_ms] = params::<5>(frames)?;
                let mode =
                    LockMode::parse(&mode).ok_or_else(|| format!("invalid mode: {mode}"))?;
                let timeout_ms = timeout_ms
                    .parse::<u64>()
                    .map_err(|_| format!("invalid timeout: {timeout_ms}"))?;
                Ok(Request::Acquire {
                    key,
                    client_id,
                    token,
                    mode,
                    timeout_ms,
                })
            }
            "release" => {
                let [key, client_id, token] = params::<3>(frames)?;
                Ok(Request::Release {
                    key,
                    client_id,
                    token,
                })
            }
            "cancel" => {
                let [key, client_id, token] = params::<3>(frames)?;
                Ok(Request::Cancel {
                    key,
                    client_id,
                    token,
                })
            }
            "ping" => match frames.len() {
                1 => Ok(Request::Ping { client_id: None }),
                2 => Ok(Request::Ping {
                    client_id: Some(text(&frames[1])?),
                }),
                n => Err(format!("ping takes at most 1 parameter, got {}", n - 1)),
            },
            "protocol-version" => {
                if frames.len() != 1 {
                    return Err("protocol-version takes no parameters".to_string());
                }
                Ok(Request::ProtocolVersion)
            }
            other => Err(format!("unknown command: {other}")),
        }
    }
}

/// A server reply: a single frame whose first token names the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Pong,
    Version(String),
    Timeout,
    WouldBlock,
    NotHeld,
    UpgradeDenied,
    Malformed,
}

impl Reply {
    /// Encode into wire frames (always exactly one).
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let frame = match self {
            Reply::Ok => "ok".to_string(),
            Reply::Pong => "pong".to_string(),
            Reply::Version(v) => format!("version {v}"),
            Reply::Timeout => "timeout".to_string(),
            Reply::WouldBlock => "would-block".to_string(),
            Reply::NotHeld => "not-held".to_string(),
            Reply::UpgradeDenied => "upgrade-denied".to_string(),
            Reply::Malformed => "malformed".to_string(),
        };
        vec![frame.into_bytes()]
    }

    /// Decode from wire frames.
    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, String> {
        if frames.len() != 1 {
            return Err(format!("reply must be a single frame, got {}", frames.len()));
        }
        let frame = text(&frames[0])?;
        let mut tokens = frame.splitn(2, ' ');
        match tokens.next().unwrap_or("") {
            "ok" => Ok(Reply::Ok),
            "pong" => Ok(Reply::Pong),
            "version" => {
                let v = tokens
                    .next()
                    .ok_or_else(|| "version reply without version".to_string())?;
                Ok(Reply::Version(v.to_string()))
            }
            "timeout" => Ok(Reply::Timeout),
            "would-block" => Ok(Reply::WouldBlock),
            "not-held" => Ok(Reply::NotHeld),
            "upgrade-denied" => Ok(Reply::UpgradeDenied),
            "malformed" => Ok(Reply::Malformed),
            other => Err(format!("unknown reply: {other}")),
        }
    }
}

fn text(frame: &[u8]) -> Result<String, String> {
    String::from_utf8(frame.to_vec()).map_err(|_| "frame is not valid UTF-8".to_string())
}

/// Extract exactly N positional parameters after the command frame.
fn params<const N: usize>(frames: &[Vec<u8>]) -> Result<[String; N], String> {
    if frames.len() != N + 1 {
        return Err(format!(
            "expected {N} parameters, got {}",
            frames.len().saturating_sub(1)
        ));
    }
    let mut out: Vec<String> = Vec::with_capacity(N);
    for frame in &frames[1..] {
        out.push(text(frame)?);
    }
    out.try_into()
        .map_err(|_| "parameter count mismatch".to_string())
}
