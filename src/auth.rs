use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Duration;
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{Id, User};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// What a signed token may be used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    #[default]
    Access,
    Remember,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub roles: Vec<Role>,
    #[serde(default)]
    pub purpose: TokenPurpose,
}

impl Claims {
    pub fn user_id(&self) -> Option<Id> {
        self.sub.parse().ok()
    }
}

/// Signs and validates HS256 tokens with the site secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    access_ttl: Duration,
    remember_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: Duration::hours(24),
            remember_ttl: Duration::days(5 * 365),
        }
    }

    pub fn issue(&self, user: &User, purpose: TokenPurpose) -> Result<String, JwtError> {
        let ttl = match purpose {
            TokenPurpose::Access => self.access_ttl,
            TokenPurpose::Remember => self.remember_ttl,
        };
        let exp = chrono::Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| JwtError::from(ErrorKind::ExpiredSignature))?
            .timestamp() as usize;
        let claims = Claims { sub: user.id.to_string(), exp, roles: vec![user.role], purpose };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
    }

    /// Validate a token and make sure it was minted for `purpose`.
    pub fn verify(&self, token: &str, purpose: TokenPurpose) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)?;
        if data.claims.purpose != purpose {
            return Err(ErrorKind::InvalidToken.into());
        }
        Ok(data.claims)
    }
}

/// Random alphanumeric string used for opaque ids (sessions, registration tokens).
pub fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| AppError::Internal(e.to_string()))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

/// The user a request acts on behalf of; `user == None` is a guest.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user: Option<User>,
}

impl Actor {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn user(user: User) -> Self {
        Self { user: Some(user) }
    }

    pub fn is_guest(&self) -> bool {
        self.user.is_none()
    }

    pub fn is_admin(&self) -> bool {
        self.user.as_ref().map(User::is_admin).unwrap_or(false)
    }

    pub fn assert_registered(&self) -> AppResult<&User> {
        self.user.as_ref().ok_or(AppError::Unauthorized)
    }

    /// Guests and members alike are refused with `PermissionDenied`.
    pub fn assert_admin(&self) -> AppResult<&User> {
        match &self.user {
            Some(user) if user.is_admin() => Ok(user),
            _ => Err(AppError::PermissionDenied),
        }
    }
}
