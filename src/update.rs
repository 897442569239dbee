//! Updater surface, served while schema migrations are pending.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::http::middleware::DispatchRoute;
use crate::http::routes::{controller, RouteCollection};
use crate::http::{MiddlewarePipe, ServerRequest};
use crate::site::Application;
use crate::views::{self, escape};

pub fn routes(app: &Arc<Application>) -> RouteCollection {
    let mut routes = RouteCollection::new();
    routes.get("/", "index", controller(app, index)).post("/", "update", controller(app, update));
    routes
}

pub fn middleware(app: &Arc<Application>) -> MiddlewarePipe {
    let mut pipe = MiddlewarePipe::new();
    pipe.pipe(DispatchRoute::new(routes(app)));
    pipe
}

async fn index(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let pending = app.repo.pending_migrations().await?;
    let items: String = pending.iter().map(|m| format!("<li>{}</li>", escape(m))).collect();
    let password_field = if app.config.database.password.is_some() {
        "<label>Database password <input name=\"databasePassword\" type=\"password\"></label>"
    } else {
        ""
    };
    let body = format!(
        "<h1>Update required</h1>\n<p>{} pending migration(s):</p>\n<ul>{items}</ul>\n<form method=\"post\">{password_field}<button type=\"submit\">Update</button></form>",
        pending.len()
    );
    Ok(views::html(StatusCode::OK, views::page("Update", &req.locale, None, &body)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest {
    #[serde(default)]
    database_password: Option<String>,
}

async fn update(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let input: UpdateRequest = if req.body.is_empty() { UpdateRequest::default() } else { req.input()? };
    if let Some(expected) = &app.config.database.password {
        if input.database_password.as_ref() != Some(expected) {
            warn!("update attempted with a wrong database password");
            return Err(AppError::PermissionDenied);
        }
    }
    let ran = app.run_migrations().await?;
    info!(count = ran.len(), up_to_date = app.is_up_to_date(), "update finished");
    Ok(HttpResponse::Ok().json(json!({ "migrated": ran, "upToDate": app.is_up_to_date() })))
}
