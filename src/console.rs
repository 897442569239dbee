//! Command line interface. Commands call the same services as the HTTP surfaces.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::assets::FrontendAssets;
use crate::config::{Config, DatabaseConfig, DatabaseDriver, Paths};
use crate::extensions::ExtensionManager;
use crate::install::{install, AdminUser, InstallData};
use crate::repo::Repo;
use crate::settings::{MailConfig, Settings};
use crate::site::open_repo;

#[derive(Debug, Parser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
#[command(about = "Ember forum server and maintenance commands")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the forum over HTTP
    Serve {
        /// Address to bind (falls back to EMBER_BIND, then 0.0.0.0:8080)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run outstanding database migrations
    Migrate {},
    /// Roll back every migration
    Reset {
        /// Required: the reset drops all data
        #[arg(long)]
        force: bool,
    },
    /// Install a new site
    Install {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
        #[arg(long)]
        admin_username: String,
        #[arg(long)]
        admin_email: String,
        #[arg(long)]
        admin_password: String,
        #[arg(long, value_enum, default_value_t = DriverArg::Memory)]
        driver: DriverArg,
        #[arg(long)]
        database_url: Option<String>,
        #[arg(long)]
        debug: bool,
    },
    /// Print information about the installation
    Info {},
    /// Remove compiled frontend assets
    #[command(name = "cache:clear")]
    CacheClear {},
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum DriverArg {
    Memory,
    Postgres,
}

impl From<DriverArg> for DatabaseDriver {
    fn from(d: DriverArg) -> Self {
        match d {
            DriverArg::Memory => DatabaseDriver::Memory,
            DriverArg::Postgres => DatabaseDriver::Postgres,
        }
    }
}

async fn installed_repo(paths: &Paths) -> Result<(Config, std::sync::Arc<dyn Repo>)> {
    if !paths.is_installed() {
        bail!("site is not installed (no config at {})", paths.config.display());
    }
    let config = Config::load(&paths.config)?;
    let repo = open_repo(&config, paths).await?;
    Ok((config, repo))
}

pub async fn migrate(paths: &Paths) -> Result<Vec<String>> {
    let (_, repo) = installed_repo(paths).await?;
    let ran = repo.migrate().await?;
    for migration in &ran {
        info!(%migration, "migrated");
    }
    Ok(ran)
}

pub async fn reset(paths: &Paths) -> Result<()> {
    let (_, repo) = installed_repo(paths).await?;
    repo.reset().await?;
    info!("all migrations rolled back");
    Ok(())
}

pub async fn install_site(paths: &Paths, data: InstallData) -> Result<Config> {
    install(paths, data).await.context("installation failed")
}

#[allow(clippy::too_many_arguments)]
pub fn install_data(
    title: String,
    url: String,
    admin_username: String,
    admin_email: String,
    admin_password: String,
    driver: DriverArg,
    database_url: Option<String>,
    debug: bool,
) -> InstallData {
    InstallData {
        forum_title: title,
        base_url: url,
        debug,
        database: DatabaseConfig { driver: driver.into(), url: database_url, password: None },
        admin: AdminUser { username: admin_username, email: admin_email, password: admin_password },
        settings: HashMap::new(),
    }
}

/// Human readable installation report.
pub async fn info(paths: &Paths) -> Result<String> {
    let (config, repo) = installed_repo(paths).await?;
    let pending = repo.pending_migrations().await?;
    let settings = Settings::new(repo.clone(), Default::default());
    settings.load().await?;
    let mail = MailConfig::from_settings(&settings);
    let enabled = ExtensionManager::enabled(&settings);

    let mut out = String::new();
    writeln!(out, "Ember version:      {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "Base URL:           {}", config.url)?;
    writeln!(out, "Database driver:    {:?}", config.database.driver)?;
    writeln!(out, "Debug mode:         {}", if config.debug { "ON" } else { "off" })?;
    writeln!(out, "Maintenance mode:   {}", if config.offline { "ON" } else { "off" })?;
    writeln!(out, "Pending migrations: {}", pending.len())?;
    writeln!(out, "Users:              {}", repo.count_users().await?)?;
    writeln!(out, "Mail driver:        {}", mail.driver)?;
    writeln!(out, "Enabled extensions: {}", if enabled.is_empty() { "none".to_string() } else { enabled.join(", ") })?;
    Ok(out)
}

pub fn clear_cache(paths: &Paths) {
    FrontendAssets::new(paths.assets()).flush_all();
    info!("asset cache cleared");
}
