//! Server-side lock state: grants and wait queues.
//!
//! All methods are called from the single server actor task, so the table
//! needs no interior locking. Deferred replies travel through the oneshot
//! senders captured in queued waiters; the table sends every reply itself,
//! immediately or when scheduling later makes a decision.
//!
//! Scheduling rules per key:
//! 1. A writer at the head of the queue is granted only when no grant of
//!    any kind is held.
//! 2. Otherwise the contiguous prefix of readers at the head is granted
//!    together.
//! 3. A newly arriving reader never overtakes a queued writer; it is
//!    appended and waits its turn.
//! 4. Ties are broken by arrival order; the queue is strictly FIFO.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::net::protocol::{LockMode, Reply};

/// A held lock: one client, one key, one mode.
///
/// The token list is the re-entrancy refcount: every successful acquire by
/// the holding client appends its token, and every release removes one. The
/// grant disappears when the last token is released.
#[derive(Debug)]
pub struct Grant {
    pub client_id: String,
    pub mode: LockMode,
    pub tokens: Vec<String>,
    pub acquired_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

/// A pending acquire waiting in a key's FIFO queue.
#[derive(Debug)]
pub struct Waiter {
    pub client_id: String,
    pub token: String,
    pub mode: LockMode,
    pub deadline: Instant,
    pub reply: oneshot::Sender<Reply>,
}

#[derive(Debug, Default)]
struct KeyState {
    grants: Vec<Grant>,
    queue: VecDeque<Waiter>,
}

impl KeyState {
    fn write_held(&self) -> bool {
        self.grants.iter().any(|g| g.mode == LockMode::Write)
    }

    fn add_grant(&mut self, client_id: String, mode: LockMode, token: String) {
        let now = Utc::now();
        if let Some(grant) = self
            .grants
            .iter_mut()
            .find(|g| g.client_id == client_id && g.mode == mode)
        {
            if !grant.tokens.contains(&token) {
                grant.tokens.push(token);
            }
            grant.last_renewed_at = now;
        } else {
            self.grants.push(Grant {
                client_id,
                mode,
                tokens: vec![token],
                acquired_at: now,
                last_renewed_at: now,
            });
        }
    }

    /// Serve the queue head while the lock state permits.
    ///
    /// Waiters whose reply channel is gone are skipped without recording a
    /// grant; their session cleanup is already underway.
    fn pump(&mut self) -> usize {
        let mut granted = 0;
        while let Some(head_mode) = self.queue.front().map(|w| w.mode) {
            match head_mode {
                LockMode::Write => {
                    if !self.grants.is_empty() {
                        break;
                    }
                    if let Some(waiter) = self.queue.pop_front() {
                        if waiter.reply.send(Reply::Ok).is_ok() {
                            self.add_grant(waiter.client_id, LockMode::Write, waiter.token);
                            granted += 1;
                            break;
                        }
                    }
                }
                LockMode::Read => {
                    if self.write_held() {
                        break;
                    }
                    if let Some(waiter) = self.queue.pop_front() {
                        if waiter.reply.send(Reply::Ok).is_ok() {
                            self.add_grant(waiter.client_id, LockMode::Read, waiter.token);
                            granted += 1;
                        }
                    }
                }
            }
        }
        granted
    }

    fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.queue.is_empty()
    }
}

/// The table of held and pending locks, keyed by canonical lock key.
#[derive(Debug, Default)]
pub struct LockTable {
    keys: HashMap<String, KeyState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process an acquire request. The reply is sent on `reply`, either
    /// immediately or once the waiter is granted, times out or is cancelled.
    pub fn acquire(
        &mut self,
        key: &str,
        client_id: &str,
        token: &str,
        mode: LockMode,
        timeout_ms: u64,
        now: Instant,
        reply: oneshot::Sender<Reply>,
    ) {
        let state = self.keys.entry(key.to_string()).or_default();

        // Re-entrant acquire by a current holder.
        if let Some(grant) = state
            .grants
            .iter_mut()
            .find(|g| g.client_id == client_id)
        {
            if grant.mode == mode {
                if !grant.tokens.iter().any(|t| t == token) {
                    grant.tokens.push(token.to_string());
                }
                grant.last_renewed_at = Utc::now();
                let _ = reply.send(Reply::Ok);
            } else {
                debug!(key, client_id, "mode change attempted while holding");
                let _ = reply.send(Reply::UpgradeDenied);
            }
            return;
        }

        // Retransmission of an acquire that is already queued: keep the
        // original FIFO position, just refresh the reply channel.
        if let Some(waiter) = state
            .queue
            .iter_mut()
            .find(|w| w.client_id == client_id && w.token == token)
        {
            waiter.reply = reply;
            return;
        }

        let compatible = match mode {
            LockMode::Read => !state.write_held(),
            LockMode::Write => state.grants.is_empty(),
        };

        // A compatible reader may still not jump a queued writer.
        if compatible && state.queue.is_empty() {
            state.add_grant(client_id.to_string(), mode, token.to_string());
            let _ = reply.send(Reply::Ok);
            return;
        }

        if timeout_ms == 0 {
            let _ = reply.send(Reply::WouldBlock);
            return;
        }

        state.queue.push_back(Waiter {
            client_id: client_id.to_string(),
            token: token.to_string(),
            mode,
            deadline: now + Duration::from_millis(timeout_ms),
            reply,
        });
    }

    /// Release one token of a grant. Replies `not-held` unless
    /// `{key, client_id, token}` names a held token.
    pub fn release(&mut self, key: &str, client_id: &str, token: &str) -> Reply {
        let Some(state) = self.keys.get_mut(key) else {
            return Reply::NotHeld;
        };
        let Some(grant_idx) = state
            .grants
            .iter()
            .position(|g| g.client_id == client_id)
        else {
            return Reply::NotHeld;
        };
        let grant = &mut state.grants[grant_idx];
        let Some(token_idx) = grant.tokens.iter().position(|t| t == token) else {
            return Reply::NotHeld;
        };

        grant.tokens.remove(token_idx);
        if grant.tokens.is_empty() {
            state.grants.remove(grant_idx);
            state.pump();
        }
        self.prune(key);
        Reply::Ok
    }

    /// Drop a queued acquire the client has abandoned.
    ///
    /// If the grant raced the cancel and was already delivered, the token is
    /// released instead, so a cancelled acquire never leaks a grant.
    pub fn cancel(&mut self, key: &str, client_id: &str, token: &str) -> Reply {
        if let Some(state) = self.keys.get_mut(key) {
            if let Some(idx) = state
                .queue
                .iter()
                .position(|w| w.client_id == client_id && w.token == token)
            {
                if let Some(waiter) = state.queue.remove(idx) {
                    let _ = waiter.reply.send(Reply::Timeout);
                }
                state.pump();
                self.prune(key);
                return Reply::Ok;
            }
        }
        // Not queued: release if it was granted in the meantime.
        self.release(key, client_id, token);
        Reply::Ok
    }

    /// Release everything a vanished client held or waited for.
    ///
    /// Returns `(released_grants, dropped_waiters)`.
    pub fn drop_client(&mut self, client_id: &str) -> (usize, usize) {
        let mut released = 0;
        let mut dropped = 0;
        let affected: Vec<String> = self.keys.keys().cloned().collect();
        for key in affected {
            let Some(state) = self.keys.get_mut(&key) else {
                continue;
            };
            let before_grants = state.grants.len();
            state.grants.retain(|g| g.client_id != client_id);
            released += before_grants - state.grants.len();

            let before_queue = state.queue.len();
            state.queue.retain(|w| w.client_id != client_id);
            dropped += before_queue - state.queue.len();

            state.pump();
            self.prune(&key);
        }
        (released, dropped)
    }

    /// Time out every waiter whose deadline has passed.
    ///
    /// Expired waiters are removed from their queue before the `timeout`
    /// reply is sent, so a timed-out request is never granted later.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        let affected: Vec<String> = self.keys.keys().cloned().collect();
        for key in affected {
            let Some(state) = self.keys.get_mut(&key) else {
                continue;
            };
            let mut kept = VecDeque::with_capacity(state.queue.len());
            while let Some(waiter) = state.queue.pop_front() {
                if waiter.deadline <= now {
                    let _ = waiter.reply.send(Reply::Timeout);
                    expired += 1;
                } else {
                    kept.push_back(waiter);
                }
            }
            state.queue = kept;
            state.pump();
            self.prune(&key);
        }
        expired
    }

    /// Readers and writer currently holding a key. For logs and tests.
    pub fn holders(&self, key: &str) -> (usize, bool) {
        match self.keys.get(key) {
            Some(state) => {
                let readers = state
                    .grants
                    .iter()
                    .filter(|g| g.mode == LockMode::Read)
                    .count();
                (readers, state.write_held())
            }
            None => (0, false),
        }
    }

    /// Number of queued waiters for a key.
    pub fn queue_len(&self, key: &str) -> usize {
        self.keys.get(key).map_or(0, |s| s.queue.len())
    }

    /// Total keys with any state. For logs.
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    fn prune(&mut self, key: &str) {
        if self.keys.get(key).is_some_and(KeyState::is_empty) {
            self.keys.remove(key);
        }
    }

    /// Per-key mutual exclusion: ≤1 writer and no readers, or only readers.
    #[cfg(test)]
    fn check_invariants(&self) {
        for (key, state) in &self.keys {
            let writers = state
                .grants
                .iter()
                .filter(|g| g.mode == LockMode::Write)
                .count();
            let readers = state.grants.len() - writers;
            assert!(
                writers == 0 || (writers == 1 && readers == 0),
                "key {key}: {writers} writers, {readers} readers"
            );
        }
    }
}
