use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::Role;

pub type Id = i64;

/// How long a registration token stays usable after creation.
pub const REGISTRATION_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub password_hash: String, // never rendered by controllers
    pub role: Role,
    pub locale: Option<String>,
    pub is_email_confirmed: bool,
    pub joined_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_email_confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Discussion {
    pub id: Id,
    pub title: String,
    pub content: String,
    pub author_id: Id,
    pub created_at: DateTime<Utc>,
    pub last_posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDiscussion {
    pub title: String,
    pub content: String,
    pub author_id: Id,
}

/// Short-lived credential used to finish a deferred (e.g. OAuth) sign-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationToken {
    pub id: String,
    pub provider: String,
    pub identifier: String,
    pub user_attributes: Map<String, Value>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl RegistrationToken {
    pub fn ttl() -> Duration {
        Duration::hours(REGISTRATION_TOKEN_TTL_HOURS)
    }

    /// Expired at or after the boundary, never before it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= Self::ttl()
    }
}
