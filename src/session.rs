use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::auth::random_token;
use crate::models::Id;

#[derive(Debug, Clone)]
pub struct SessionData {
    pub user_id: Option<Id>,
    pub flash_errors: Vec<String>,
    pub last_activity: DateTime<Utc>,
}

impl SessionData {
    fn new(now: DateTime<Utc>) -> Self {
        Self { user_id: None, flash_errors: Vec::new(), last_activity: now }
    }
}

/// Process-local session storage keyed by the session cookie value.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, SessionData>>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime_minutes: i64) -> Self {
        Self { sessions: Arc::new(DashMap::new()), lifetime: Duration::minutes(lifetime_minutes) }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn is_expired(&self, data: &SessionData, now: DateTime<Utc>) -> bool {
        now - data.last_activity >= self.lifetime
    }

    /// Resume the session named by `id` if it is still alive, otherwise hand out a fresh id.
    ///
    /// A fresh session is only stored once something is written to it.
    pub fn start(&self, id: Option<&str>) -> SessionHandle {
        let now = Utc::now();
        if let Some(id) = id {
            if let Some(mut data) = self.sessions.get_mut(id) {
                if !self.is_expired(&data, now) {
                    data.last_activity = now;
                    return SessionHandle::new(id.to_string(), self.clone());
                }
            }
            self.sessions.remove(id);
        }
        SessionHandle::new(random_token(40), self.clone())
    }

    pub fn get(&self, id: &str) -> Option<SessionData> {
        self.sessions.get(id).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions idle for longer than the lifetime.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, data| now - data.last_activity < self.lifetime);
        before - self.sessions.len()
    }

    /// Apply `f` to a stored session; unknown ids are left alone.
    fn update<F: FnOnce(&mut SessionData)>(&self, id: &str, f: F) {
        if let Some(mut data) = self.sessions.get_mut(id) {
            f(&mut data);
        }
    }

    /// Apply `f`, storing the session first if it only existed as an id.
    fn write<F: FnOnce(&mut SessionData)>(&self, id: &str, f: F) {
        let mut data = self.sessions.entry(id.to_string()).or_insert_with(|| SessionData::new(Utc::now()));
        f(&mut data);
    }

    /// Move the data stored under `old` to a new random id.
    fn migrate(&self, old: &str) -> String {
        let id = random_token(40);
        let data = self.sessions.remove(old).map(|(_, d)| d).unwrap_or_else(|| SessionData::new(Utc::now()));
        self.sessions.insert(id.clone(), data);
        id
    }
}

/// Handle to one session; writes go straight to the store.
///
/// Clones share the id, so a migration made anywhere in the pipeline is seen
/// by the stage that writes the cookie.
#[derive(Clone)]
pub struct SessionHandle {
    id: Arc<Mutex<String>>,
    store: SessionStore,
}

impl SessionHandle {
    fn new(id: String, store: SessionStore) -> Self {
        Self { id: Arc::new(Mutex::new(id)), store }
    }

    pub fn id(&self) -> String {
        self.id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether anything was ever written to this session.
    pub fn is_stored(&self) -> bool {
        self.store.get(&self.id()).is_some()
    }

    pub fn user_id(&self) -> Option<Id> {
        self.store.get(&self.id()).and_then(|d| d.user_id)
    }

    fn regenerate(&self) {
        let mut id = self.id.lock().unwrap_or_else(PoisonError::into_inner);
        *id = self.store.migrate(&id);
    }

    /// Authenticate the session under a new id so a planted id stays anonymous.
    pub fn login(&self, user_id: Id) {
        self.regenerate();
        self.store.write(&self.id(), |d| d.user_id = Some(user_id));
    }

    pub fn logout(&self) {
        if !self.is_stored() {
            return;
        }
        self.regenerate();
        self.store.update(&self.id(), |d| d.user_id = None);
    }

    pub fn flash_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.store.write(&self.id(), |d| d.flash_errors.push(message));
    }

    pub fn take_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        self.store.update(&self.id(), |d| errors = std::mem::take(&mut d.flash_errors));
        errors
    }
}
