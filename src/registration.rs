//! Registration tokens and user sign-up.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::auth::{hash_password, random_token, Actor, Role};
use crate::error::{AppError, AppResult};
use crate::models::{NewUser, RegistrationToken, User};
use crate::repo::Repo;
use crate::site::Application;

/// Mint a token without persisting it.
pub fn generate(provider: &str, identifier: &str, user_attributes: Map<String, Value>, payload: Value) -> RegistrationToken {
    RegistrationToken {
        id: random_token(40),
        provider: provider.to_string(),
        identifier: identifier.to_string(),
        user_attributes,
        payload,
        created_at: Utc::now(),
    }
}

/// Mint and persist a token for a deferred sign-up.
pub async fn issue(
    repo: &dyn Repo,
    provider: &str,
    identifier: &str,
    user_attributes: Map<String, Value>,
    payload: Value,
) -> AppResult<RegistrationToken> {
    let token = generate(provider, identifier, user_attributes, payload);
    repo.save_registration_token(token.clone()).await?;
    info!(provider, "registration token issued");
    Ok(token)
}

/// Look up a token that is still inside its validity window at `now`.
pub async fn valid_or_fail(repo: &dyn Repo, id: &str, now: DateTime<Utc>) -> AppResult<RegistrationToken> {
    match repo.find_registration_token(id).await? {
        Some(token) if !token.is_expired_at(now) => Ok(token),
        _ => Err(AppError::InvalidConfirmationToken),
    }
}

pub async fn purge_expired(repo: &dyn Repo, now: DateTime<Utc>) -> AppResult<usize> {
    Ok(repo.purge_registration_tokens(now - RegistrationToken::ttl()).await?)
}

#[derive(Debug, Default, Deserialize)]
pub struct Registration {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    /// Registration token completing a deferred sign-up.
    pub token: Option<String>,
}

fn validate_username(username: &str) -> AppResult<()> {
    let ok_len = (3..=30).contains(&username.chars().count());
    let ok_chars = username.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_');
    if ok_len && ok_chars {
        Ok(())
    } else {
        Err(AppError::Validation("username must be 3-30 letters, digits, dashes or underscores".into()))
    }
}

fn validate_email(email: &str) -> AppResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(AppError::Validation("email address is invalid".into())),
    }
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < 8 {
        return Err(AppError::Validation("password must be at least 8 characters".into()));
    }
    Ok(())
}

/// Create a user account; a registration token supplies (and overrides) attributes
/// and is consumed on success.
pub async fn register_user(app: &Application, input: Registration, actor: &Actor) -> AppResult<User> {
    if !actor.is_admin() && app.settings.get("allow_sign_up").as_deref() != Some("1") {
        return Err(AppError::PermissionDenied);
    }
    let repo = &*app.repo;

    let mut username = input.username;
    let mut email = input.email;
    let mut password = input.password;
    let mut trusted_email = false;

    let token = match input.token.as_deref() {
        Some(id) => Some(valid_or_fail(repo, id, Utc::now()).await?),
        None => None,
    };
    if let Some(token) = &token {
        let attr = |key: &str| token.user_attributes.get(key).and_then(Value::as_str).map(str::to_string);
        if let Some(u) = attr("username") {
            username = Some(u);
        }
        if let Some(e) = attr("email") {
            email = Some(e);
            trusted_email = true;
        }
        // provider-backed accounts may not have a local password yet
        if password.is_none() {
            password = Some(random_token(32));
        }
    }

    let username = username.ok_or_else(|| AppError::Validation("username is required".into()))?;
    let email = email.ok_or_else(|| AppError::Validation("email is required".into()))?;
    let password = password.ok_or_else(|| AppError::Validation("password is required".into()))?;
    validate_username(&username)?;
    validate_email(&email)?;
    validate_password(&password)?;

    let user = repo
        .create_user(NewUser {
            username,
            email,
            password_hash: hash_password(&password)?,
            role: Role::User,
            is_email_confirmed: trusted_email,
        })
        .await?;

    if let Some(token) = token {
        repo.delete_registration_token(&token.id).await?;
    }
    info!(user_id = user.id, "user registered");
    Ok(user)
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;
    use crate::repo::inmem::InMemRepo;
    use crate::repo::TokenRepo;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn token_validity_window_is_half_open() {
        let repo = InMemRepo::ephemeral();
        let token = issue(&repo, "github", "12345", Map::new(), json!({"login": "toby"})).await.unwrap();
        let created = token.created_at;

        assert!(valid_or_fail(&repo, &token.id, created).await.is_ok());
        let almost = created + Duration::hours(24) - Duration::seconds(1);
        assert_eq!(valid_or_fail(&repo, &token.id, almost).await.unwrap().identifier, "12345");
        let boundary = created + Duration::hours(24);
        assert!(matches!(
            valid_or_fail(&repo, &token.id, boundary).await,
            Err(AppError::InvalidConfirmationToken)
        ));
    }

    #[tokio::test]
    async fn unknown_token_fails() {
        let repo = InMemRepo::ephemeral();
        assert!(matches!(
            valid_or_fail(&repo, "missing", Utc::now()).await,
            Err(AppError::InvalidConfirmationToken)
        ));
    }

    #[tokio::test]
    async fn purge_only_drops_expired_tokens() {
        let repo = InMemRepo::ephemeral();
        let fresh = issue(&repo, "github", "1", Map::new(), Value::Null).await.unwrap();
        let mut stale = generate("github", "2", Map::new(), Value::Null);
        stale.created_at = Utc::now() - Duration::hours(25);
        repo.save_registration_token(stale.clone()).await.unwrap();

        assert_eq!(purge_expired(&repo, Utc::now()).await.unwrap(), 1);
        assert!(repo.find_registration_token(&fresh.id).await.unwrap().is_some());
        assert!(repo.find_registration_token(&stale.id).await.unwrap().is_none());
    }

    #[test]
    fn field_validation() {
        assert!(validate_username("toby_w").is_ok());
        assert!(validate_username("t").is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_email("a@b.io").is_ok());
        assert!(validate_email("nope").is_err());
        assert!(validate_password("short").is_err());
    }
}
