//! Site bootstrapping and per-request mode selection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::admin;
use crate::api;
use crate::assets::{compile_stylesheet, FrontendAssets};
use crate::auth::TokenIssuer;
use crate::config::{Config, DatabaseDriver, Paths};
use crate::error::{AppError, AppResult};
use crate::events::{Dispatcher, Event};
use crate::extensions::{Extender, ExtenderSet, ExtensionManager};
use crate::forum;
use crate::http::{path, strip_prefix, MiddlewarePipe, RequestHandler, ServerRequest, Surface};
use crate::install::Installer;
use crate::locale::LocaleManager;
use crate::repo::{Repo, RepoResult};
use crate::session::SessionStore;
use crate::settings::{MailConfig, Settings};
use crate::update;
use crate::views::MAINTENANCE_HTML;

/// Services shared by every request of an installed site.
pub struct Application {
    pub config: Config,
    pub paths: Paths,
    pub repo: Arc<dyn Repo>,
    pub settings: Settings,
    pub events: Arc<Dispatcher>,
    pub sessions: SessionStore,
    pub assets: FrontendAssets,
    pub tokens: TokenIssuer,
    pub extensions: ExtensionManager,
    extender_set: ExtenderSet,
    extenders: RwLock<Vec<Arc<dyn Extender>>>,
    locales: RwLock<LocaleManager>,
    mail: RwLock<MailConfig>,
    up_to_date: AtomicBool,
}

impl Application {
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    /// Error details are shown while debugging or while the schema is stale.
    pub fn in_debug_mode(&self) -> bool {
        !self.is_up_to_date() || self.config.debug
    }

    /// Extenders active for this boot.
    pub fn extenders(&self) -> Vec<Arc<dyn Extender>> {
        self.extenders.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn locales(&self) -> LocaleManager {
        self.locales.read().map(|l| l.clone()).unwrap_or_default()
    }

    /// Recompute the active extenders from the enabled setting and subscribe the new ones.
    fn activate_extenders(&self) {
        let active = self.extender_set.active(&ExtensionManager::enabled(&self.settings));
        let mut locales = LocaleManager::default();
        for extender in &active {
            extender.configure_locales(&mut locales);
        }
        if let Ok(mut current) = self.locales.write() {
            *current = locales;
        }
        let Ok(mut current) = self.extenders.write() else {
            return;
        };
        for extender in &active {
            if !current.iter().any(|e| Arc::ptr_eq(e, extender)) {
                extender.subscribe(&self.events);
            }
        }
        *current = active;
    }

    pub fn mail_config(&self) -> MailConfig {
        self.mail.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Re-check pending migrations; once current, reload settings, reseed mail and
    /// pick up the extensions enabled in the database.
    pub async fn refresh_migration_state(&self) -> RepoResult<bool> {
        let up_to_date = self.repo.pending_migrations().await?.is_empty();
        if up_to_date {
            self.settings.load().await?;
            if let Ok(mut mail) = self.mail.write() {
                *mail = MailConfig::from_settings(&self.settings);
            }
            self.activate_extenders();
        }
        self.up_to_date.store(up_to_date, Ordering::SeqCst);
        Ok(up_to_date)
    }

    pub async fn run_migrations(&self) -> RepoResult<Vec<String>> {
        let ran = self.repo.migrate().await?;
        for migration in &ran {
            info!(%migration, "migrated");
        }
        self.refresh_migration_state().await?;
        Ok(ran)
    }

    pub fn clear_cache(&self) {
        self.assets.flush_all();
        self.events.dispatch(&Event::CacheCleared);
    }

    /// Versioned url of a surface stylesheet, compiling it on a cache miss.
    pub fn stylesheet_url(&self, surface: Surface) -> AppResult<String> {
        let asset = self
            .assets
            .css(surface, || compile_stylesheet(&self.settings))
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let mount = self.config.surface_path(surface)?;
        Ok(format!("{}/assets/{}.css?v={}", mount.trim_end_matches('/'), surface, asset.revision))
    }
}

/// What an installed site serves right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Maintenance,
    Update,
    Normal,
}

pub fn select_mode(offline: bool, needs_update: bool) -> Mode {
    if offline {
        Mode::Maintenance
    } else if needs_update {
        Mode::Update
    } else {
        Mode::Normal
    }
}

/// Top-level request handler the HTTP entry point talks to.
#[async_trait(?Send)]
pub trait AppInterface: Send + Sync {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse>;

    /// Whether the entry point should boot the site again before the next request.
    fn needs_reboot(&self) -> bool {
        false
    }
}

/// 503 responder used while the site is offline.
struct Maintenance {
    api_prefix: String,
}

#[async_trait(?Send)]
impl RequestHandler for Maintenance {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        if strip_prefix(&self.api_prefix, &req.path).is_some() {
            return Ok(AppError::Unavailable.to_json_response(false));
        }
        Ok(HttpResponse::build(StatusCode::SERVICE_UNAVAILABLE)
            .content_type("text/html; charset=utf-8")
            .body(MAINTENANCE_HTML))
    }
}

/// An installed site: maintenance, update or normal pipeline chosen per request.
pub struct InstalledApp {
    app: Arc<Application>,
    maintenance: Maintenance,
    updater: MiddlewarePipe,
    normal: OnceCell<MiddlewarePipe>,
}

impl InstalledApp {
    pub fn new(app: Arc<Application>) -> AppResult<Self> {
        let api_prefix = app.config.surface_path(Surface::Api)?;
        let mut updater = MiddlewarePipe::new();
        updater.pipe(path(&app.config.surface_path(Surface::Update)?, update::middleware(&app)));
        Ok(Self { maintenance: Maintenance { api_prefix }, updater, normal: OnceCell::new(), app })
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.app
    }

    pub fn mode(&self) -> Mode {
        select_mode(self.app.config.offline, !self.app.is_up_to_date())
    }

    // Built on first use: surface routes read settings that only load once the schema is current.
    fn normal(&self) -> AppResult<&MiddlewarePipe> {
        self.normal.get_or_try_init(|| build_normal_pipeline(&self.app))
    }
}

/// API, admin and forum sub-pipelines mounted at their configured prefixes.
pub fn build_normal_pipeline(app: &Arc<Application>) -> AppResult<MiddlewarePipe> {
    let config = &app.config;
    let mut pipe = MiddlewarePipe::new();
    pipe.pipe(path(&config.surface_path(Surface::Api)?, api::middleware(app)))
        .pipe(path(&config.surface_path(Surface::Admin)?, admin::middleware(app)))
        .pipe(path(&config.surface_path(Surface::Forum)?, forum::middleware(app)));
    Ok(pipe)
}

#[async_trait(?Send)]
impl AppInterface for InstalledApp {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        match self.mode() {
            Mode::Maintenance => self.maintenance.handle(req).await,
            Mode::Update => self.updater.handle(req).await,
            Mode::Normal => self.normal()?.handle(req).await,
        }
    }
}

/// Open the configured persistence backend.
pub async fn open_repo(config: &Config, paths: &Paths) -> anyhow::Result<Arc<dyn Repo>> {
    match config.database.driver {
        DatabaseDriver::Memory => open_memory(paths),
        DatabaseDriver::Postgres => open_postgres(config).await,
    }
}

#[cfg(feature = "inmem-store")]
fn open_memory(paths: &Paths) -> anyhow::Result<Arc<dyn Repo>> {
    info!(snapshot = %paths.snapshot().display(), "using in-memory repository backend");
    Ok(Arc::new(crate::repo::inmem::InMemRepo::open(paths.snapshot())))
}

#[cfg(not(feature = "inmem-store"))]
fn open_memory(_paths: &Paths) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("the memory database driver requires the inmem-store feature")
}

#[cfg(feature = "postgres-store")]
async fn open_postgres(config: &Config) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let url = config.database.url.as_deref().context("database.url must be set for the postgres driver")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("failed to connect to postgres")?;
    info!("using postgres repository backend");
    Ok(Arc::new(crate::repo::pg::PgRepo::new(pool)))
}

#[cfg(not(feature = "postgres-store"))]
async fn open_postgres(_config: &Config) -> anyhow::Result<Arc<dyn Repo>> {
    anyhow::bail!("the postgres database driver requires the postgres-store feature")
}

/// Boot recipe for a site whose config file exists.
pub struct InstalledSite {
    paths: Paths,
    config: Config,
    extenders: ExtenderSet,
    repo: Option<Arc<dyn Repo>>,
}

impl InstalledSite {
    pub fn new(paths: Paths, config: Config) -> Self {
        Self { paths, config, extenders: ExtenderSet::default(), repo: None }
    }

    pub fn extend_with(mut self, extenders: ExtenderSet) -> Self {
        self.extenders = extenders;
        self
    }

    /// Use an already opened repository instead of the configured one.
    pub fn with_repo(mut self, repo: Arc<dyn Repo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub async fn boot(self) -> anyhow::Result<Arc<Application>> {
        let Self { paths, config, extenders, repo } = self;
        config.validate().context("invalid configuration")?;
        let repo = match repo {
            Some(repo) => repo,
            None => open_repo(&config, &paths).await?,
        };

        let events = Arc::new(Dispatcher::new());
        let settings = Settings::new(repo.clone(), events.clone());
        let pending = repo.pending_migrations().await?;
        let up_to_date = pending.is_empty();
        if up_to_date {
            settings.load().await?;
        } else {
            warn!(pending = pending.len(), "database schema is out of date, serving the updater");
        }
        let mail = if up_to_date { MailConfig::from_settings(&settings) } else { MailConfig::default() };

        let app = Arc::new(Application {
            sessions: SessionStore::new(config.session.lifetime_minutes),
            assets: FrontendAssets::new(paths.assets()),
            locales: RwLock::new(LocaleManager::default()),
            tokens: TokenIssuer::new(config.secret.clone()),
            extensions: ExtensionManager::new(extenders.names()),
            extender_set: extenders,
            extenders: RwLock::new(Vec::new()),
            mail: RwLock::new(mail),
            up_to_date: AtomicBool::new(up_to_date),
            config,
            paths,
            repo,
            settings,
            events,
        });

        forum::register_listeners(&app);
        admin::register_listeners(&app);
        app.activate_extenders();
        info!(
            url = %app.config.url,
            up_to_date,
            extensions = app.extenders().len(),
            "site booted"
        );
        Ok(app)
    }

    pub async fn boot_app(self) -> anyhow::Result<InstalledApp> {
        let app = self.boot().await?;
        Ok(InstalledApp::new(app)?)
    }
}

/// Boot recipe for a site without config: only the installer is served.
pub struct UninstalledSite {
    paths: Paths,
}

impl UninstalledSite {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn boot_app(self) -> Installer {
        info!("no configuration found, serving the installer");
        Installer::new(self.paths)
    }
}

pub enum Site {
    Installed(InstalledSite),
    Uninstalled(UninstalledSite),
}

impl Site {
    pub fn load(paths: &Paths, extenders: ExtenderSet) -> anyhow::Result<Site> {
        if !paths.is_installed() {
            return Ok(Site::Uninstalled(UninstalledSite::new(paths.clone())));
        }
        let config = Config::load(&paths.config)?;
        Ok(Site::Installed(InstalledSite::new(paths.clone(), config).extend_with(extenders)))
    }

    pub async fn boot_app(self) -> anyhow::Result<Arc<dyn AppInterface>> {
        match self {
            Site::Installed(site) => Ok(Arc::new(site.boot_app().await?)),
            Site::Uninstalled(site) => Ok(Arc::new(site.boot_app())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_wins_over_everything() {
        assert_eq!(select_mode(true, true), Mode::Maintenance);
        assert_eq!(select_mode(true, false), Mode::Maintenance);
    }

    #[test]
    fn pending_migrations_select_the_updater() {
        assert_eq!(select_mode(false, true), Mode::Update);
        assert_eq!(select_mode(false, false), Mode::Normal);
    }

    #[test]
    fn missing_config_boots_the_installer() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("config.json"), dir.path().join("storage"));
        assert!(matches!(Site::load(&paths, ExtenderSet::default()).unwrap(), Site::Uninstalled(_)));
    }
}
