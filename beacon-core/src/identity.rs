//! Device, session and user identity
//!
//! - The **device id** is generated once and persisted; it is stable for the
//!   lifetime of the install.
//! - The **session id** rotates lazily: every `track()` compares the time
//!   since the previous call with the idle timeout, no timer involved.
//! - The **user id** is optional and set through `identify()`.
//!
//! All of it sits behind one mutex because `track()` may be called from
//! many tasks at once. Session state is persisted so a restart inside the
//! idle window continues the same session and sequence.

use crate::error::Result;
use crate::storage::Storage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const DEVICE_KEY: &str = "identity/device_id";
const USER_KEY: &str = "identity/user_id";
const SESSION_KEY: &str = "identity/session";

/// Identity fields stamped onto one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub device_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub sequence_number: u64,
    /// Capture time, never earlier than the previous stamp
    pub timestamp: DateTime<Utc>,
    /// This stamp opened a new session
    pub new_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    id: String,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    next_sequence: u64,
}

impl Session {
    fn start(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            last_activity_at: now,
            next_sequence: 1,
        }
    }
}

#[derive(Debug)]
struct IdentityState {
    device_id: String,
    user_id: Option<String>,
    session: Option<Session>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Resolves and persists identity
pub struct IdentityManager {
    storage: Arc<dyn Storage>,
    idle_timeout: Duration,
    state: Mutex<IdentityState>,
}

impl IdentityManager {
    /// Load persisted identity, generating a device id on first run
    pub fn open(storage: Arc<dyn Storage>, idle_timeout: Duration) -> Result<Self> {
        let device_id = match storage.get(DEVICE_KEY)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                let id = Uuid::new_v4().to_string();
                storage.set(DEVICE_KEY, id.as_bytes())?;
                tracing::info!(device_id = %id, "Generated device id");
                id
            }
        };

        let user_id = storage
            .get(USER_KEY)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let session = match storage.get(SESSION_KEY)? {
            Some(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable session state");
                    None
                }
            },
            None => None,
        };

        let last_timestamp = session.as_ref().map(|s| s.last_activity_at);

        Ok(Self {
            storage,
            idle_timeout,
            state: Mutex::new(IdentityState {
                device_id,
                user_id,
                session,
                last_timestamp,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_device_id(&self) -> String {
        self.lock().device_id.clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.lock().user_id.clone()
    }

    /// The session the next event would belong to.
    ///
    /// Starts a new session if none is live, but does not count as activity.
    pub fn current_session_id(&self, now: DateTime<Utc>) -> String {
        let mut state = self.lock();
        let (session, started) = self.live_session(&mut state, now);
        let id = session.id.clone();
        if started {
            self.persist_session(&state);
        }
        id
    }

    /// Set or clear the authenticated user
    pub fn set_user_id(&self, user_id: Option<String>) -> Result<()> {
        let mut state = self.lock();
        match &user_id {
            Some(id) => self.storage.set(USER_KEY, id.as_bytes())?,
            None => self.storage.remove(USER_KEY)?,
        }
        tracing::debug!(identified = user_id.is_some(), "User id updated");
        state.user_id = user_id;
        Ok(())
    }

    /// Stamp one event, rotating the session if it went idle
    pub fn stamp(&self, now: DateTime<Utc>) -> Stamp {
        let mut state = self.lock();

        let timestamp = match state.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        state.last_timestamp = Some(timestamp);

        let (session, new_session) = self.live_session(&mut state, timestamp);
        let sequence_number = session.next_sequence;
        session.next_sequence += 1;
        session.last_activity_at = timestamp;
        let session_id = session.id.clone();

        self.persist_session(&state);

        Stamp {
            device_id: state.device_id.clone(),
            session_id,
            user_id: state.user_id.clone(),
            sequence_number,
            timestamp,
            new_session,
        }
    }

    /// Returns the live session, starting one if needed.
    fn live_session<'s>(
        &self,
        state: &'s mut IdentityState,
        now: DateTime<Utc>,
    ) -> (&'s mut Session, bool) {
        let expired = match &state.session {
            Some(session) => now - session.last_activity_at >= self.idle_timeout,
            None => true,
        };

        if expired {
            let session = Session::start(now);
            tracing::debug!(session_id = %session.id, "Starting new session");
            state.session = Some(session);
        }

        let session = state.session.get_or_insert_with(|| Session::start(now));
        (session, expired)
    }

    /// Session state is advisory; a failed write keeps the in-memory copy.
    fn persist_session(&self, state: &IdentityState) {
        let Some(session) = &state.session else {
            return;
        };
        let result = serde_json::to_vec(session)
            .map_err(crate::error::Error::from)
            .and_then(|bytes| self.storage.set(SESSION_KEY, &bytes));
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist session state");
        }
    }
}
