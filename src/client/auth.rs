//! Session upkeep for the exchange token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::BetfairConfig;

use super::{ClientError, ExchangeApi};

/// Keepalive is forced once this long has passed since the last successful one.
pub const KEEPALIVE_STALENESS_MINUTES: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unvalidated,
    Valid,
    Invalid,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    last_keepalive: Option<DateTime<Utc>>,
}

/// Tracks whether the session token is usable and refreshes it when stale.
pub struct SessionGuardian {
    api: Arc<dyn ExchangeApi>,
    staleness: Duration,
    inner: Mutex<SessionInner>,
}

impl SessionGuardian {
    pub fn new(api: Arc<dyn ExchangeApi>) -> Self {
        Self {
            api,
            staleness: Duration::minutes(KEEPALIVE_STALENESS_MINUTES),
            inner: Mutex::new(SessionInner {
                state: SessionState::Unvalidated,
                last_keepalive: None,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn last_keepalive(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_keepalive
    }

    /// Readiness gate: credentials present and the session not known to be invalid.
    pub fn is_ready(&self, creds: &BetfairConfig) -> bool {
        creds.has_credentials() && self.state() != SessionState::Invalid
    }

    /// Forget everything learned about the previous token.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Unvalidated;
        inner.last_keepalive = None;
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    /// Feed an error from any API call; session-invalidating codes flip the state.
    pub fn observe_error(&self, err: &ClientError) {
        if err.is_session_error() {
            warn!(target: "client", error = %err, "session invalidated by upstream");
            self.set_state(SessionState::Invalid);
        }
    }

    async fn keepalive_at(&self, creds: &BetfairConfig, now: DateTime<Utc>) -> bool {
        if !creds.has_credentials() {
            self.set_state(SessionState::Invalid);
            return false;
        }
        match self.api.keepalive(creds).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.state = SessionState::Valid;
                inner.last_keepalive = Some(now);
                debug!(target: "client", "keepalive successful");
                true
            }
            Err(err) => {
                warn!(target: "client", error = %err, "keepalive failed");
                self.set_state(SessionState::Invalid);
                false
            }
        }
    }

    /// Explicit validation probe; the result fully decides the session state.
    pub async fn validate(&self, creds: &BetfairConfig) -> Result<(), String> {
        if !creds.has_credentials() {
            self.set_state(SessionState::Invalid);
            return Err(ClientError::MissingCredentials.to_string());
        }
        match self.api.validate_session(creds).await {
            Ok(()) => {
                self.set_state(SessionState::Valid);
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Invalid);
                Err(format!("session invalid or expired: {err}"))
            }
        }
    }

    /// Trust cached validity unless the last keepalive is older than the staleness window.
    pub async fn ensure_fresh(&self, creds: &BetfairConfig, now: DateTime<Utc>) -> bool {
        if !creds.has_credentials() {
            return false;
        }
        let (state, last) = {
            let inner = self.inner.lock();
            (inner.state, inner.last_keepalive)
        };
        let stale = match last {
            None => true,
            Some(at) => now - at > self.staleness,
        };
        if stale {
            return self.keepalive_at(creds, now).await;
        }
        state != SessionState::Invalid
    }
}
