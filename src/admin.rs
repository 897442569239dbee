//! Administration surface.

use std::sync::Arc;

use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;

use crate::error::{AppError, AppResult};
use crate::events::Event;
use crate::extensions::ExtensionManager;
use crate::http::middleware::{
    AuthenticateWithSession, DispatchRoute, ErrorFormat, HandleErrors, ParseJsonBody, RememberFromCookie,
    RequireAdministrateAbility, SetLocale, StartSession,
};
use crate::http::routes::{controller, RouteCollection};
use crate::http::{MiddlewarePipe, ServerRequest, Surface};
use crate::settings::is_theme_key;
use crate::site::Application;
use crate::views::{self, escape};

/// Keys never echoed back to the admin page.
const HIDDEN_SETTINGS: &[&str] = &["mail_password"];

pub fn register_listeners(app: &Arc<Application>) {
    let assets = app.assets.clone();
    app.events.listen(move |event| match event {
        Event::SettingSaved { key, .. } if is_theme_key(key) => assets.flush_css(Surface::Admin),
        Event::ExtensionEnabled(_) | Event::ExtensionDisabled(_) => assets.flush(Surface::Admin),
        _ => {}
    });
}

pub fn routes(app: &Arc<Application>) -> RouteCollection {
    let mut routes = RouteCollection::new();
    routes
        .get("/", "index", controller(app, index))
        .get("/assets/admin.css", "assets.css", controller(app, stylesheet));
    for extender in app.extenders() {
        extender.configure_routes(&mut routes, Surface::Admin, app);
    }
    routes
}

pub fn middleware(app: &Arc<Application>) -> MiddlewarePipe {
    let mut pipe = MiddlewarePipe::new();
    pipe.pipe(HandleErrors::new(ErrorFormat::Html, app.in_debug_mode()))
        .pipe(ParseJsonBody)
        .pipe(StartSession::new(app))
        .pipe(RememberFromCookie::new(app))
        .pipe(AuthenticateWithSession::new(app))
        .pipe(SetLocale::new(app))
        .pipe(RequireAdministrateAbility);
    for extender in app.extenders() {
        extender.configure_middleware(&mut pipe, Surface::Admin, app);
    }
    pipe.pipe(DispatchRoute::new(routes(app)));
    pipe
}

async fn index(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let mut settings: Vec<(String, String)> = app
        .settings
        .all()
        .into_iter()
        .filter(|(k, _)| !HIDDEN_SETTINGS.contains(&k.as_str()))
        .collect();
    settings.sort();
    let rows: String = settings
        .iter()
        .map(|(k, v)| format!("<tr><th>{}</th><td>{}</td></tr>", escape(k), escape(v)))
        .collect();

    let enabled = ExtensionManager::enabled(&app.settings);
    let extensions: String = app
        .extensions
        .available()
        .iter()
        .map(|name| {
            let state = if enabled.contains(name) { "enabled" } else { "disabled" };
            format!("<li data-state=\"{state}\">{} ({state})</li>", escape(name))
        })
        .collect();

    let mail = app.mail_config();
    let sender = match (&mail.from_name, &mail.from_address) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.clone(),
        _ => "not configured".into(),
    };
    let mail_rows = format!(
        "<tr><th>driver</th><td>{}</td></tr><tr><th>from</th><td>{}</td></tr>",
        escape(&mail.driver),
        escape(&sender)
    );

    let body = format!(
        "<h1>Administration</h1>\n<h2>Settings</h2>\n<table class=\"settings\">{rows}</table>\n<h2>Mail</h2>\n<table class=\"mail\">{mail_rows}</table>\n<h2>Extensions</h2>\n<ul class=\"extensions\">{extensions}</ul>"
    );
    let stylesheet = app.stylesheet_url(Surface::Admin)?;
    Ok(views::html(StatusCode::OK, views::page("Administration", &req.locale, Some(&stylesheet), &body)))
}

async fn stylesheet(app: Arc<Application>, _req: ServerRequest) -> AppResult<HttpResponse> {
    let asset = app
        .assets
        .css(Surface::Admin, || crate::assets::compile_stylesheet(&app.settings))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok()
        .content_type("text/css; charset=utf-8")
        .insert_header((header::ETAG, format!("\"{}\"", asset.revision)))
        .body(asset.content))
}
