//! actix-web adapter: every request is funnelled into the current site app.

use std::sync::{Arc, RwLock};

use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse, ResponseError};
use tracing::{error, info};

use super::ServerRequest;
use crate::config::Paths;
use crate::extensions::ExtenderSet;
use crate::site::{AppInterface, Site};

/// Owns the booted site and swaps it out when the app asks for a reboot.
pub struct Server {
    paths: Paths,
    extenders: ExtenderSet,
    app: RwLock<Arc<dyn AppInterface>>,
}

impl Server {
    pub async fn boot(paths: Paths, extenders: ExtenderSet) -> anyhow::Result<Self> {
        let app = Site::load(&paths, extenders.clone())?.boot_app().await?;
        Ok(Self { paths, extenders, app: RwLock::new(app) })
    }

    pub fn current(&self) -> Option<Arc<dyn AppInterface>> {
        self.app.read().ok().map(|app| app.clone())
    }

    pub async fn handle(&self, req: ServerRequest) -> HttpResponse {
        let Some(app) = self.current() else {
            error!("site lock poisoned");
            return HttpResponse::InternalServerError().finish();
        };
        let result = app.handle(req).await;
        if app.needs_reboot() {
            self.reboot().await;
        }
        match result {
            Ok(res) => res,
            Err(e) => e.error_response(),
        }
    }

    async fn reboot(&self) {
        let booted = match Site::load(&self.paths, self.extenders.clone()) {
            Ok(site) => site.boot_app().await,
            Err(e) => Err(e),
        };
        match booted {
            Ok(app) => {
                if let Ok(mut current) = self.app.write() {
                    *current = app;
                    info!("site rebooted");
                }
            }
            Err(e) => error!(error = %e, "site reboot failed"),
        }
    }
}

async fn dispatch(req: HttpRequest, body: Bytes, server: web::Data<Server>) -> HttpResponse {
    server.handle(ServerRequest::new(req, body)).await
}

/// Route every request through [`Server`]; expects `web::Data<Server>` in app data.
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.default_service(web::to(dispatch));
}
