//! In-memory session registry with lazy expiry on read and a periodic sweeper.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::{AppError, Result};
use crate::ids::{IdGenerator, TokenIds};
use crate::models::{Session, UserId};

/// Default period of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    shutdown_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::with_capacity(1024),
            clock,
            ids,
            shutdown_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(Arc::new(SystemClock), Arc::new(TokenIds::default()))
    }

    pub fn create_session(&self, user_id: UserId, long_term: bool) -> String {
        let now = self.clock.now();
        loop {
            let id = self.ids.new_id();
            // Only a vacant slot is taken; a live id is never overwritten.
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                slot.insert(Session::new(id.clone(), user_id, long_term, now));
                debug!("Created session for user {} (long_term={})", user_id, long_term);
                return id;
            }
        }
    }

    /// Evicts `session_id` if it is still expired at `now`.
    fn evict_if_expired(&self, session_id: &str) -> bool {
        let now = self.clock.now();
        self.sessions
            .remove_if(session_id, |_, s| s.is_expired(now))
            .is_some()
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        let now = self.clock.now();
        match self.sessions.get(session_id) {
            None => return Err(AppError::not_found("session")),
            Some(session) if !session.is_expired(now) => return Ok(session.clone()),
            Some(_) => {}
        }
        // The read guard is released before removing.
        self.evict_if_expired(session_id);
        Err(AppError::Expired)
    }

    /// Pushes expiry to now + TTL. Not cumulative: the old expiry is discarded.
    pub fn extend_session(&self, session_id: &str) -> Result<Session> {
        let now = self.clock.now();
        {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return Err(AppError::not_found("session"));
            };
            if !session.is_expired(now) {
                session.refresh(now);
                return Ok(session.clone());
            }
        }
        self.evict_if_expired(session_id);
        Err(AppError::Expired)
    }

    /// Removing an unknown id is not an error.
    pub fn delete_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Drops every session of `user_id`, e.g. after a password change.
    pub fn revoke_user_sessions(&self, user_id: UserId) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Revoked {} sessions of user {}", removed, user_id);
        }
        removed
    }

    /// One sweep pass. Returns the number of evicted sessions.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = !s.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Starts the background sweeper. A second call while one is running is a no-op.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let store = Arc::downgrade(self);
        let token = self.shutdown_token.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Session sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let removed = store.purge_expired();
                        if removed > 0 {
                            info!("Session sweep evicted {} expired sessions", removed);
                        }
                    }
                }
            }
        }));
        info!("Session sweeper started (every {:?})", interval);
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Session sweeper ended abnormally: {}", e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
