use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Schema migrations in the order they are applied.
pub const MIGRATIONS: &[&str] = &[
    "create settings table",
    "create users table",
    "create discussions table",
    "create registration tokens table",
];

#[async_trait]
pub trait SettingsRepo: Send + Sync {
    async fn all_settings(&self) -> RepoResult<HashMap<String, String>>;
    async fn set_setting(&self, key: &str, value: &str) -> RepoResult<()>;
    async fn delete_setting(&self, key: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    /// Look a user up by username or email (case-insensitive).
    async fn find_user_by_login(&self, identification: &str) -> RepoResult<Option<User>>;
    async fn count_users(&self) -> RepoResult<usize>;
}

#[async_trait]
pub trait DiscussionRepo: Send + Sync {
    async fn list_discussions(&self, limit: usize, offset: usize) -> RepoResult<Vec<Discussion>>;
    async fn get_discussion(&self, id: Id) -> RepoResult<Discussion>;
    async fn create_discussion(&self, new: NewDiscussion) -> RepoResult<Discussion>;
}

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn save_registration_token(&self, token: RegistrationToken) -> RepoResult<()>;
    async fn find_registration_token(&self, id: &str) -> RepoResult<Option<RegistrationToken>>;
    async fn delete_registration_token(&self, id: &str) -> RepoResult<()>;
    /// Drop every token created before `cutoff`; returns how many went.
    async fn purge_registration_tokens(&self, cutoff: DateTime<Utc>) -> RepoResult<usize>;
}

#[async_trait]
pub trait MigrationRepo: Send + Sync {
    async fn pending_migrations(&self) -> RepoResult<Vec<String>>;
    /// Apply everything pending; returns the names applied.
    async fn migrate(&self) -> RepoResult<Vec<String>>;
    /// Roll back every migration, dropping all data.
    async fn reset(&self) -> RepoResult<()>;
}

pub trait Repo: SettingsRepo + UserRepo + DiscussionRepo + TokenRepo + MigrationRepo {}

impl<T> Repo for T where T: SettingsRepo + UserRepo + DiscussionRepo + TokenRepo + MigrationRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use tracing::{info, warn};

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        settings: BTreeMap<String, String>,
        users: BTreeMap<Id, User>,
        discussions: BTreeMap<Id, Discussion>,
        registration_tokens: HashMap<String, RegistrationToken>,
        migrations: Vec<String>,
        next_id: Id,
    }

    /// Map-backed store, optionally snapshotted to a JSON file after each write.
    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    impl InMemRepo {
        /// Open (or start) a store persisted at `path`.
        pub fn open(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let state = Self::load_state_from(&path);
            Self { state: Arc::new(RwLock::new(state)), snapshot_path: Some(Arc::new(path)) }
        }

        /// A store that never touches the filesystem.
        pub fn ephemeral() -> Self {
            Self::default()
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        warn!("failed to parse snapshot '{}': {e}; starting empty", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn persist(&self) -> RepoResult<()> {
            let Some(path) = self.snapshot_path.as_ref() else { return Ok(()) };
            let bytes = serde_json::to_vec_pretty(&*self.read()?)
                .map_err(|e| RepoError::Internal(e.to_string()))?;
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            std::fs::write(&**path, bytes).map_err(|e| {
                warn!("failed to write snapshot '{}': {e}", path.display());
                RepoError::Internal(e.to_string())
            })
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }
    }

    #[async_trait]
    impl SettingsRepo for InMemRepo {
        async fn all_settings(&self) -> RepoResult<HashMap<String, String>> {
            Ok(self.read()?.settings.clone().into_iter().collect())
        }
        async fn set_setting(&self, key: &str, value: &str) -> RepoResult<()> {
            self.write()?.settings.insert(key.to_string(), value.to_string());
            self.persist()
        }
        async fn delete_setting(&self, key: &str) -> RepoResult<()> {
            self.write()?.settings.remove(key);
            self.persist()
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.write()?;
            let taken = s.users.values().any(|u| {
                u.username.eq_ignore_ascii_case(&new.username) || u.email.eq_ignore_ascii_case(&new.email)
            });
            if taken {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let user = User {
                id,
                username: new.username,
                email: new.email,
                password_hash: new.password_hash,
                role: new.role,
                locale: None,
                is_email_confirmed: new.is_email_confirmed,
                joined_at: Utc::now(),
            };
            s.users.insert(id, user.clone());
            drop(s); // release lock before persisting
            self.persist()?;
            Ok(user)
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            self.read()?.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn find_user_by_login(&self, identification: &str) -> RepoResult<Option<User>> {
            let s = self.read()?;
            Ok(s.users
                .values()
                .find(|u| {
                    u.username.eq_ignore_ascii_case(identification) || u.email.eq_ignore_ascii_case(identification)
                })
                .cloned())
        }
        async fn count_users(&self) -> RepoResult<usize> {
            Ok(self.read()?.users.len())
        }
    }

    #[async_trait]
    impl DiscussionRepo for InMemRepo {
        async fn list_discussions(&self, limit: usize, offset: usize) -> RepoResult<Vec<Discussion>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.discussions.values().cloned().collect();
            v.sort_by(|a, b| b.last_posted_at.cmp(&a.last_posted_at).then(b.id.cmp(&a.id))); // latest first
            Ok(v.into_iter().skip(offset).take(limit).collect())
        }
        async fn get_discussion(&self, id: Id) -> RepoResult<Discussion> {
            self.read()?.discussions.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_discussion(&self, new: NewDiscussion) -> RepoResult<Discussion> {
            let mut s = self.write()?;
            if !s.users.contains_key(&new.author_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let discussion = Discussion {
                id,
                title: new.title,
                content: new.content,
                author_id: new.author_id,
                created_at: now,
                last_posted_at: now,
            };
            s.discussions.insert(id, discussion.clone());
            drop(s);
            self.persist()?;
            Ok(discussion)
        }
    }

    #[async_trait]
    impl TokenRepo for InMemRepo {
        async fn save_registration_token(&self, token: RegistrationToken) -> RepoResult<()> {
            let mut s = self.write()?;
            if s.registration_tokens.contains_key(&token.id) {
                return Err(RepoError::Conflict);
            }
            s.registration_tokens.insert(token.id.clone(), token);
            drop(s);
            self.persist()
        }
        async fn find_registration_token(&self, id: &str) -> RepoResult<Option<RegistrationToken>> {
            Ok(self.read()?.registration_tokens.get(id).cloned())
        }
        async fn delete_registration_token(&self, id: &str) -> RepoResult<()> {
            self.write()?.registration_tokens.remove(id);
            self.persist()
        }
        async fn purge_registration_tokens(&self, cutoff: DateTime<Utc>) -> RepoResult<usize> {
            let mut s = self.write()?;
            let before = s.registration_tokens.len();
            s.registration_tokens.retain(|_, t| t.created_at >= cutoff);
            let purged = before - s.registration_tokens.len();
            drop(s);
            if purged > 0 {
                self.persist()?;
            }
            Ok(purged)
        }
    }

    #[async_trait]
    impl MigrationRepo for InMemRepo {
        async fn pending_migrations(&self) -> RepoResult<Vec<String>> {
            let s = self.read()?;
            Ok(MIGRATIONS
                .iter()
                .filter(|m| !s.migrations.iter().any(|applied| applied == *m))
                .map(|m| m.to_string())
                .collect())
        }
        async fn migrate(&self) -> RepoResult<Vec<String>> {
            let pending = self.pending_migrations().await?;
            self.write()?.migrations.extend(pending.iter().cloned());
            self.persist()?;
            Ok(pending)
        }
        async fn reset(&self) -> RepoResult<()> {
            *self.write()? = State::default();
            self.persist()
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use crate::auth::Role;
    use serde_json::{Map, Value};
    use sqlx::types::Json;
    use sqlx::{Pool, Postgres};

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    fn db_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => RepoError::Conflict,
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23503") => RepoError::NotFound,
            other => RepoError::Internal(other.to_string()),
        }
    }

    /// Versions recorded as applied; an undefined bookkeeping table (42P01) means nothing ran yet.
    fn applied_versions(result: Result<Vec<(i64,)>, sqlx::Error>) -> RepoResult<Vec<(i64,)>> {
        match result {
            Ok(rows) => Ok(rows),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => Ok(Vec::new()),
            Err(e) => Err(db_err(e)),
        }
    }

    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: Id,
        username: String,
        email: String,
        password_hash: String,
        role: String,
        locale: Option<String>,
        is_email_confirmed: bool,
        joined_at: DateTime<Utc>,
    }

    impl From<UserRow> for User {
        fn from(r: UserRow) -> Self {
            User {
                id: r.id,
                username: r.username,
                email: r.email,
                password_hash: r.password_hash,
                role: Role::parse(&r.role).unwrap_or_default(),
                locale: r.locale,
                is_email_confirmed: r.is_email_confirmed,
                joined_at: r.joined_at,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct TokenRow {
        id: String,
        provider: String,
        identifier: String,
        user_attributes: Json<Map<String, Value>>,
        payload: Json<Value>,
        created_at: DateTime<Utc>,
    }

    impl From<TokenRow> for RegistrationToken {
        fn from(r: TokenRow) -> Self {
            RegistrationToken {
                id: r.id,
                provider: r.provider,
                identifier: r.identifier,
                user_attributes: r.user_attributes.0,
                payload: r.payload.0,
                created_at: r.created_at,
            }
        }
    }

    const USER_COLUMNS: &str = "id, username, email, password_hash, role, locale, is_email_confirmed, joined_at";

    #[async_trait]
    impl SettingsRepo for PgRepo {
        async fn all_settings(&self) -> RepoResult<HashMap<String, String>> {
            let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
                .fetch_all(&self.pool).await.map_err(db_err)?;
            Ok(rows.into_iter().collect())
        }
        async fn set_setting(&self, key: &str, value: &str) -> RepoResult<()> {
            sqlx::query("INSERT INTO settings (key, value) VALUES ($1,$2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value")
                .bind(key).bind(value)
                .execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
        async fn delete_setting(&self, key: &str) -> RepoResult<()> {
            sqlx::query("DELETE FROM settings WHERE key = $1").bind(key)
                .execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "INSERT INTO users (username, email, password_hash, role, is_email_confirmed) VALUES ($1,$2,$3,$4,$5) RETURNING {USER_COLUMNS}"
            ))
            .bind(&new.username).bind(&new.email).bind(&new.password_hash)
            .bind(new.role.as_str()).bind(new.is_email_confirmed)
            .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn find_user_by_login(&self, identification: &str) -> RepoResult<Option<User>> {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1) OR lower(email) = lower($1) LIMIT 1"
            ))
            .bind(identification)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
            Ok(row.map(User::from))
        }
        async fn count_users(&self) -> RepoResult<usize> {
            let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
                .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(n as usize)
        }
    }

    #[async_trait]
    impl DiscussionRepo for PgRepo {
        async fn list_discussions(&self, limit: usize, offset: usize) -> RepoResult<Vec<Discussion>> {
            let recs = sqlx::query_as::<_, Discussion>(
                "SELECT id, title, content, author_id, created_at, last_posted_at FROM discussions ORDER BY last_posted_at DESC, id DESC LIMIT $1 OFFSET $2"
            )
            .bind(limit as i64).bind(offset as i64)
            .fetch_all(&self.pool).await.map_err(db_err)?;
            Ok(recs)
        }
        async fn get_discussion(&self, id: Id) -> RepoResult<Discussion> {
            sqlx::query_as::<_, Discussion>(
                "SELECT id, title, content, author_id, created_at, last_posted_at FROM discussions WHERE id = $1"
            )
            .bind(id)
            .fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn create_discussion(&self, new: NewDiscussion) -> RepoResult<Discussion> {
            sqlx::query_as::<_, Discussion>(
                "INSERT INTO discussions (title, content, author_id) VALUES ($1,$2,$3) RETURNING id, title, content, author_id, created_at, last_posted_at"
            )
            .bind(&new.title).bind(&new.content).bind(new.author_id)
            .fetch_one(&self.pool).await.map_err(db_err)
        }
    }

    #[async_trait]
    impl TokenRepo for PgRepo {
        async fn save_registration_token(&self, token: RegistrationToken) -> RepoResult<()> {
            sqlx::query("INSERT INTO registration_tokens (id, provider, identifier, user_attributes, payload, created_at) VALUES ($1,$2,$3,$4,$5,$6)")
                .bind(&token.id).bind(&token.provider).bind(&token.identifier)
                .bind(Json(&token.user_attributes)).bind(Json(&token.payload)).bind(token.created_at)
                .execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
        async fn find_registration_token(&self, id: &str) -> RepoResult<Option<RegistrationToken>> {
            let row = sqlx::query_as::<_, TokenRow>(
                "SELECT id, provider, identifier, user_attributes, payload, created_at FROM registration_tokens WHERE id = $1"
            )
            .bind(id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
            Ok(row.map(RegistrationToken::from))
        }
        async fn delete_registration_token(&self, id: &str) -> RepoResult<()> {
            sqlx::query("DELETE FROM registration_tokens WHERE id = $1").bind(id)
                .execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
        async fn purge_registration_tokens(&self, cutoff: DateTime<Utc>) -> RepoResult<usize> {
            let res = sqlx::query("DELETE FROM registration_tokens WHERE created_at < $1").bind(cutoff)
                .execute(&self.pool).await.map_err(db_err)?;
            Ok(res.rows_affected() as usize)
        }
    }

    #[async_trait]
    impl MigrationRepo for PgRepo {
        async fn pending_migrations(&self) -> RepoResult<Vec<String>> {
            let applied = applied_versions(
                sqlx::query_as("SELECT version FROM _sqlx_migrations WHERE success").fetch_all(&self.pool).await,
            )?;
            Ok(MIGRATOR
                .iter()
                .filter(|m| !m.migration_type.is_down_migration())
                .filter(|m| !applied.iter().any(|(v,)| *v == m.version))
                .map(|m| m.description.to_string())
                .collect())
        }
        async fn migrate(&self) -> RepoResult<Vec<String>> {
            let pending = self.pending_migrations().await?;
            MIGRATOR.run(&self.pool).await.map_err(|e| RepoError::Internal(e.to_string()))?;
            Ok(pending)
        }
        async fn reset(&self) -> RepoResult<()> {
            MIGRATOR.undo(&self.pool, 0).await.map_err(|e| RepoError::Internal(e.to_string()))
        }
    }

}
