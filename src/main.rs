use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use ember::config::Paths;
use ember::console::{self, Cli, Command};
use ember::extensions::ExtenderSet;
use ember::http::server::{self, Server};

#[actix_web::main]
async fn main() -> Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let paths = Paths::from_env();

    match cli.command {
        Command::Serve { bind } => serve(paths, bind).await?,
        Command::Migrate {} => {
            let ran = console::migrate(&paths).await?;
            println!("{} migration(s) applied", ran.len());
        }
        Command::Reset { force } => {
            if !force {
                anyhow::bail!("refusing to reset without --force");
            }
            console::reset(&paths).await?;
        }
        Command::Install { title, url, admin_username, admin_email, admin_password, driver, database_url, debug } => {
            let data = console::install_data(
                title,
                url,
                admin_username,
                admin_email,
                admin_password,
                driver,
                database_url,
                debug,
            );
            let config = console::install_site(&paths, data).await?;
            println!("Installed at {}", config.url);
        }
        Command::Info {} => print!("{}", console::info(&paths).await?),
        Command::CacheClear {} => console::clear_cache(&paths),
    }

    Ok(())
}

async fn serve(paths: Paths, bind: Option<String>) -> Result<()> {
    let bind = bind
        .or_else(|| std::env::var("EMBER_BIND").ok())
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    info!("Bootstrapping Ember server");
    let server = web::Data::new(Server::boot(paths, ExtenderSet::default()).await?);

    let http = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(server.clone())
            .configure(server::config)
    })
    .bind(&bind)?;

    info!("Listening on http://{bind}");
    http.run().await?;
    Ok(())
}
