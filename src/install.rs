//! Installation: shared service plus the installer surface served by an uninstalled site.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::{hash_password, random_token, Role};
use crate::config::{Config, DatabaseConfig, DatabaseDriver, Paths};
use crate::error::{AppError, AppResult};
use crate::extensions::ENABLED_KEY;
use crate::http::middleware::DispatchRoute;
use crate::http::routes::RouteCollection;
use crate::http::{handler_fn, MiddlewarePipe, RequestHandler, ServerRequest};
use crate::locale::FALLBACK_LOCALE;
use crate::models::NewUser;
use crate::repo::Repo;
use crate::site::{open_repo, AppInterface};
use crate::views::{self, escape};

#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Everything needed to install a site.
#[derive(Debug, Clone)]
pub struct InstallData {
    pub forum_title: String,
    pub base_url: String,
    pub debug: bool,
    pub database: DatabaseConfig,
    pub admin: AdminUser,
    /// Extra settings written after the defaults.
    pub settings: HashMap<String, String>,
}

fn default_settings(data: &InstallData) -> Vec<(String, String)> {
    let host = data
        .base_url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split(['/', ':']).next())
        .unwrap_or("localhost");
    [
        ("allow_sign_up", "1".to_string()),
        ("default_locale", FALLBACK_LOCALE.to_string()),
        ("default_route", "/all".to_string()),
        (ENABLED_KEY, "[]".to_string()),
        ("forum_title", data.forum_title.clone()),
        ("forum_description", String::new()),
        ("mail_driver", "mail".to_string()),
        ("mail_from", format!("noreply@{host}")),
        ("theme_primary_color", "#4D698E".to_string()),
        ("theme_secondary_color", "#4D698E".to_string()),
        ("theme_dark_mode", "0".to_string()),
        ("welcome_title", format!("Welcome to {}", data.forum_title)),
        ("welcome_message", "Enjoy your new forum!".to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn validate(data: &InstallData) -> AppResult<()> {
    if data.forum_title.trim().is_empty() {
        return Err(AppError::Validation("forum title is required".into()));
    }
    if data.admin.username.trim().len() < 3 {
        return Err(AppError::Validation("admin username must be at least 3 characters".into()));
    }
    if !data.admin.email.contains('@') {
        return Err(AppError::Validation("admin email is invalid".into()));
    }
    if data.admin.password.chars().count() < 8 {
        return Err(AppError::Validation("admin password must be at least 8 characters".into()));
    }
    Ok(())
}

/// Refuse to start when the config file could not be written afterwards.
fn ensure_writable(config: &Path) -> AppResult<()> {
    let fail = |e: std::io::Error| AppError::Internal(format!("cannot write {}: {e}", config.display()));
    if let Some(dir) = config.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(fail)?;
    }
    let mut check = config.as_os_str().to_owned();
    check.push(".check");
    let check = PathBuf::from(check);
    fs::write(&check, b"").map_err(fail)?;
    fs::remove_file(&check).map_err(fail)
}

async fn seed(repo: &dyn Repo, data: &InstallData) -> AppResult<()> {
    let ran = repo.migrate().await?;
    info!(migrations = ran.len(), "database migrated");

    for (key, value) in default_settings(data).into_iter().chain(data.settings.clone()) {
        repo.set_setting(&key, &value).await?;
    }

    let admin = repo
        .create_user(NewUser {
            username: data.admin.username.trim().to_string(),
            email: data.admin.email.trim().to_string(),
            password_hash: hash_password(&data.admin.password)?,
            role: Role::Admin,
            is_email_confirmed: true,
        })
        .await?;
    info!(user_id = admin.id, "administrator created");
    Ok(())
}

/// Migrate, seed settings, create the admin and finally write the config file.
///
/// The config file is written last: its existence is what marks the site installed.
/// A failure after the database was touched rolls it back so the install can be retried.
pub async fn install(paths: &Paths, data: InstallData) -> AppResult<Config> {
    if paths.is_installed() {
        return Err(AppError::Conflict);
    }
    validate(&data)?;

    let config = Config {
        debug: data.debug,
        url: data.base_url.trim_end_matches('/').to_string(),
        database: data.database.clone(),
        secret: random_token(48),
        ..Config::default()
    };
    config.validate()?;
    ensure_writable(&paths.config)?;

    let repo = open_repo(&config, paths).await.map_err(|e| AppError::Internal(e.to_string()))?;
    let finished = match seed(&*repo, &data).await {
        Ok(()) => config.save(&paths.config).map_err(AppError::from),
        Err(e) => Err(e),
    };
    if let Err(e) = finished {
        warn!(error = %e, "installation failed, rolling the database back");
        if let Err(reset) = repo.reset().await {
            warn!(error = %reset, "database rollback failed");
        }
        return Err(e);
    }
    info!(config = %paths.config.display(), url = %config.url, "installation complete");
    Ok(config)
}

/// Fields posted by the install form (or JSON client).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub forum_title: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
    #[serde(default)]
    pub admin_password_confirmation: Option<String>,
    #[serde(default)]
    pub database_driver: Option<DatabaseDriver>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub database_password: Option<String>,
}

impl InstallRequest {
    pub fn into_data(self, fallback_url: String) -> AppResult<InstallData> {
        if let Some(confirmation) = &self.admin_password_confirmation {
            if confirmation != &self.admin_password {
                return Err(AppError::Validation("password confirmation does not match".into()));
            }
        }
        Ok(InstallData {
            forum_title: self.forum_title,
            base_url: self.base_url.filter(|u| !u.is_empty()).unwrap_or(fallback_url),
            debug: false,
            database: DatabaseConfig {
                driver: self.database_driver.unwrap_or_default(),
                url: self.database_url.filter(|u| !u.is_empty()),
                password: self.database_password.filter(|p| !p.is_empty()),
            },
            admin: AdminUser {
                username: self.admin_username,
                email: self.admin_email,
                password: self.admin_password,
            },
            settings: HashMap::new(),
        })
    }
}

const INSTALL_FORM: &str = r#"<h1>Install</h1>
<form method="post">
<label>Forum title <input name="forumTitle"></label>
<label>Admin username <input name="adminUsername"></label>
<label>Admin email <input name="adminEmail" type="email"></label>
<label>Admin password <input name="adminPassword" type="password"></label>
<label>Confirm password <input name="adminPasswordConfirmation" type="password"></label>
<button type="submit">Install</button>
</form>"#;

/// Serves the install routes until an installation succeeds.
pub struct Installer {
    pipe: MiddlewarePipe,
    completed: Arc<AtomicBool>,
}

impl Installer {
    pub fn new(paths: Paths) -> Self {
        let completed = Arc::new(AtomicBool::new(false));
        let mut routes = RouteCollection::new();
        routes.get(
            "/",
            "index",
            Arc::new(handler_fn(|_req| async {
                Ok(views::html(StatusCode::OK, views::page("Install", FALLBACK_LOCALE, None, INSTALL_FORM)))
            })),
        );
        let install_handler: Arc<dyn RequestHandler> = {
            let completed = completed.clone();
            Arc::new(handler_fn(move |req| perform(paths.clone(), completed.clone(), req)))
        };
        routes.post("/", "install", install_handler);

        let mut pipe = MiddlewarePipe::new();
        pipe.pipe(DispatchRoute::new(routes));
        Self { pipe, completed }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

async fn perform(paths: Paths, completed: Arc<AtomicBool>, req: ServerRequest) -> AppResult<HttpResponse> {
    let fallback_url = {
        let conn = req.http().connection_info();
        format!("{}://{}", conn.scheme(), conn.host())
    };
    let request: InstallRequest = req.input()?;
    let config = install(&paths, request.into_data(fallback_url)?).await?;
    completed.store(true, Ordering::SeqCst);
    if req.wants_json() {
        return Ok(HttpResponse::Created().json(json!({ "url": config.url })));
    }
    let body = format!(
        "<h1>Installed</h1><p><a href=\"{}\">Go to your forum</a></p>",
        escape(&config.url)
    );
    Ok(views::html(StatusCode::CREATED, views::page("Installed", FALLBACK_LOCALE, None, &body)))
}

#[async_trait(?Send)]
impl AppInterface for Installer {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        self.pipe.handle(req).await
    }

    fn needs_reboot(&self) -> bool {
        self.is_complete()
    }
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;

    fn data() -> InstallData {
        InstallData {
            forum_title: "Ember".into(),
            base_url: "http://forum.test/".into(),
            debug: false,
            database: DatabaseConfig::default(),
            admin: AdminUser {
                username: "admin".into(),
                email: "admin@forum.test".into(),
                password: "correct horse".into(),
            },
            settings: HashMap::from([("forum_description".to_string(), "A test".to_string())]),
        }
    }

    #[tokio::test]
    async fn install_writes_config_last_and_refuses_twice() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("config.json"), dir.path().join("storage"));
        let config = install(&paths, data()).await.unwrap();
        assert!(paths.is_installed());
        assert_eq!(config.url, "http://forum.test");
        assert!(config.secret.len() >= 32);

        let repo = open_repo(&config, &paths).await.unwrap();
        let settings = repo.all_settings().await.unwrap();
        assert_eq!(settings["mail_from"], "noreply@forum.test");
        assert_eq!(settings["forum_description"], "A test");
        assert!(repo.pending_migrations().await.unwrap().is_empty());

        assert!(matches!(install(&paths, data()).await, Err(AppError::Conflict)));
    }

    #[tokio::test]
    async fn weak_admin_password_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("config.json"), dir.path().join("storage"));
        let mut bad = data();
        bad.admin.password = "short".into();
        assert!(matches!(install(&paths, bad).await, Err(AppError::Validation(_))));
        assert!(!paths.is_installed());
    }

    #[tokio::test]
    async fn unwritable_config_location_fails_before_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let storage = dir.path().join("storage");

        let paths = Paths::new(blocker.join("config.json"), storage.clone());
        assert!(matches!(install(&paths, data()).await, Err(AppError::Internal(_))));
        assert!(!paths.snapshot().exists());

        let paths = Paths::new(dir.path().join("config.json"), storage);
        install(&paths, data()).await.unwrap();
        assert!(paths.is_installed());
    }

    #[tokio::test]
    async fn failed_config_write_rolls_back_and_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("config.json"), dir.path().join("storage"));
        // a directory where the file should go passes the location check but cannot be written
        fs::create_dir(&paths.config).unwrap();

        assert!(install(&paths, data()).await.is_err());
        assert!(!paths.is_installed());
        let leftover = open_repo(&Config::default(), &paths).await.unwrap();
        assert_eq!(leftover.count_users().await.unwrap(), 0);
        assert!(!leftover.pending_migrations().await.unwrap().is_empty());

        fs::remove_dir(&paths.config).unwrap();
        let config = install(&paths, data()).await.unwrap();
        let repo = open_repo(&config, &paths).await.unwrap();
        assert_eq!(repo.count_users().await.unwrap(), 1);
    }
}
