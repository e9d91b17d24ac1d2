use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::store::Store;

pub const SESSION_COOKIE: &str = "firecares_session";

/// Server-side state of one browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub oauth_state: Option<String>,
    pub user_id: Option<i64>,
    pub messages: Vec<String>,
}

/// Sessions persisted through the `Store`, each living `ttl` past its last
/// save.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn Store>,
    ttl: TimeDelta,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionData>> {
        self.store.load_session(session_id, Utc::now()).await
    }

    pub async fn save(&self, session_id: &str, data: &SessionData) -> anyhow::Result<()> {
        let expires_at = self.expires_at(Utc::now());
        self.store.save_session(session_id, data, expires_at).await
    }

    pub async fn remove(&self, session_id: &str) -> anyhow::Result<()> {
        self.store.delete_session(session_id).await
    }

    /// Moves `data` under a fresh id, dropping `previous`. Used at login so a
    /// session id seen before authentication is never reused after it.
    pub async fn cycle(&self, previous: Option<&str>, data: &SessionData) -> anyhow::Result<String> {
        let session_id = new_session_id();
        self.save(&session_id, data).await?;
        if let Some(previous) = previous {
            self.remove(previous).await?;
        }
        Ok(session_id)
    }

    /// Consumes the pending sign-in nonce when it equals `state`. Two
    /// callbacks racing on one nonce cannot both succeed.
    pub async fn take_state(
        &self,
        session_id: &str,
        state: &str,
    ) -> anyhow::Result<Option<SessionData>> {
        self.store
            .take_oauth_state(session_id, state, Utc::now())
            .await
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.store.delete_expired_sessions(Utc::now()).await
    }
}

/// Deletes expired sessions every `every` until the runtime shuts down.
pub fn spawn_sweeper(sessions: SessionStore, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sessions.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired sessions removed"),
                Err(err) => tracing::warn!(error = %err, "session sweep failed"),
            }
        }
    })
}

pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(session_id: &str) -> String {
    format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax")
}

pub fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}
