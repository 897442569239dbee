//! Public forum surface.

use std::sync::Arc;

use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header;
use actix_web::http::{Method, StatusCode};
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{verify_password, TokenPurpose};
use crate::error::{AppError, AppResult};
use crate::events::Event;
use crate::http::middleware::{
    AuthenticateWithSession, CollectGarbage, DispatchRoute, ErrorFormat, HandleErrors, ParseJsonBody,
    RememberFromCookie, SetLocale, ShareErrorsFromSession, StartSession, REMEMBER_COOKIE,
};
use crate::http::routes::{controller, RouteCollection};
use crate::http::{MiddlewarePipe, ServerRequest, Surface};
use crate::models::{Discussion, Id};
use crate::registration::{register_user, Registration};
use crate::settings::is_theme_key;
use crate::site::Application;
use crate::views::{self, escape};

/// Flush forum assets whenever theme settings or extensions change.
pub fn register_listeners(app: &Arc<Application>) {
    let assets = app.assets.clone();
    app.events.listen(move |event| match event {
        Event::SettingSaved { key, .. } if is_theme_key(key) => assets.flush_css(Surface::Forum),
        Event::ExtensionEnabled(_) | Event::ExtensionDisabled(_) => assets.flush(Surface::Forum),
        _ => {}
    });
}

pub fn populate_routes(routes: &mut RouteCollection, app: &Arc<Application>) {
    routes
        .get("/all", "index", controller(app, index))
        .get("/d/{id}", "discussion", controller(app, show_discussion))
        .get("/assets/forum.css", "assets.css", controller(app, stylesheet))
        .post("/login", "login", controller(app, login))
        .post("/logout", "logout", controller(app, logout))
        .post("/register", "register", controller(app, register));
}

/// Built-in routes, extension routes, then `/` bound to the configured default route.
pub fn routes(app: &Arc<Application>) -> RouteCollection {
    let mut routes = RouteCollection::new();
    populate_routes(&mut routes, app);
    for extender in app.extenders() {
        extender.configure_routes(&mut routes, Surface::Forum, app);
    }
    let default_route = app.settings.get_or("default_route", "/all");
    let handler = match routes.find(&Method::GET, &default_route) {
        Some(found) if found.params.is_empty() => found.route.handler(),
        _ => controller(app, index),
    };
    routes.get("/", "default", handler);
    routes
}

pub fn middleware(app: &Arc<Application>) -> MiddlewarePipe {
    let mut pipe = MiddlewarePipe::new();
    pipe.pipe(HandleErrors::new(ErrorFormat::Html, app.in_debug_mode()))
        .pipe(ParseJsonBody)
        .pipe(CollectGarbage::new(app))
        .pipe(StartSession::new(app))
        .pipe(RememberFromCookie::new(app))
        .pipe(AuthenticateWithSession::new(app))
        .pipe(SetLocale::new(app))
        .pipe(ShareErrorsFromSession);
    for extender in app.extenders() {
        extender.configure_middleware(&mut pipe, Surface::Forum, app);
    }
    pipe.pipe(DispatchRoute::new(routes(app)));
    pipe
}

fn forum_url(app: &Application, target: &str) -> AppResult<String> {
    let base = app.config.surface_path(Surface::Forum)?;
    Ok(format!("{}{}", base.trim_end_matches('/'), target))
}

fn redirect(location: String) -> HttpResponse {
    HttpResponse::SeeOther().insert_header((header::LOCATION, location)).finish()
}

fn header_html(app: &Application, req: &ServerRequest) -> String {
    let title = app.settings.get_or("forum_title", "Ember");
    let who = match &req.actor.user {
        Some(user) => format!("<p class=\"session\">Logged in as {}</p>", escape(&user.username)),
        None => String::new(),
    };
    format!("<header><h1>{}</h1>{who}</header>\n{}", escape(&title), views::error_list(&req.errors))
}

fn render(app: &Application, req: &ServerRequest, title: &str, content: &str) -> AppResult<HttpResponse> {
    let stylesheet = app.stylesheet_url(Surface::Forum)?;
    let body = format!("{}\n<main>{content}</main>", header_html(app, req));
    Ok(views::html(StatusCode::OK, views::page(title, &req.locale, Some(&stylesheet), &body)))
}

fn discussion_link(app: &Application, d: &Discussion) -> AppResult<String> {
    let href = forum_url(app, &format!("/d/{}", d.id))?;
    Ok(format!("<li><a href=\"{}\">{}</a></li>", escape(&href), escape(&d.title)))
}

async fn index(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let discussions = app.repo.list_discussions(20, 0).await?;
    let mut list = String::from("<ul class=\"discussions\">");
    for d in &discussions {
        list.push_str(&discussion_link(&app, d)?);
    }
    list.push_str("</ul>");
    let welcome = app.settings.get_or("welcome_title", "");
    let content = format!("<h2>{}</h2>\n{list}", escape(&welcome));
    render(&app, &req, &app.settings.get_or("forum_title", "Ember"), &content)
}

async fn show_discussion(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let id: Id = req
        .query_param("id")
        .and_then(|id| id.parse().ok())
        .ok_or(AppError::NotFound)?;
    let discussion = app.repo.get_discussion(id).await?;
    let content = format!(
        "<article><h2>{}</h2><p>{}</p></article>",
        escape(&discussion.title),
        escape(&discussion.content)
    );
    render(&app, &req, &discussion.title, &content)
}

async fn stylesheet(app: Arc<Application>, _req: ServerRequest) -> AppResult<HttpResponse> {
    let asset = app
        .assets
        .css(Surface::Forum, || crate::assets::compile_stylesheet(&app.settings))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok()
        .content_type("text/css; charset=utf-8")
        .insert_header((header::ETAG, format!("\"{}\"", asset.revision)))
        .body(asset.content))
}

#[derive(Debug, Deserialize)]
struct LoginInput {
    identification: String,
    password: String,
    #[serde(default)]
    remember: Option<Value>,
}

impl LoginInput {
    fn wants_remember(&self) -> bool {
        match &self.remember {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "on"),
            _ => false,
        }
    }
}

async fn login(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let input: LoginInput = req.input()?;
    let session = req.session.as_ref().ok_or_else(|| AppError::Internal("session not started".into()))?;
    let user = app
        .repo
        .find_user_by_login(&input.identification)
        .await?
        .filter(|u| verify_password(&input.password, &u.password_hash));
    let Some(user) = user else {
        if req.wants_json() {
            return Err(AppError::Unauthorized);
        }
        session.flash_error("Those credentials were not recognised.");
        return Ok(redirect(forum_url(&app, "/")?));
    };

    session.login(user.id);
    info!(user_id = user.id, "user logged in");
    let mut res = if req.wants_json() {
        HttpResponse::Ok().json(json!({ "userId": user.id }))
    } else {
        redirect(forum_url(&app, "/")?)
    };
    if input.wants_remember() {
        let token = app
            .tokens
            .issue(&user, TokenPurpose::Remember)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let cookie = Cookie::build(REMEMBER_COOKIE, token)
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::days(5 * 365))
            .finish();
        res.add_cookie(&cookie).map_err(|e| AppError::Internal(e.to_string()))?;
    }
    Ok(res)
}

async fn logout(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    if let Some(session) = &req.session {
        session.logout();
    }
    let mut res = redirect(forum_url(&app, "/")?);
    let mut expired = Cookie::named(REMEMBER_COOKIE);
    expired.set_path("/");
    expired.make_removal();
    res.add_cookie(&expired).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(res)
}

async fn register(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let input: Registration = req.input()?;
    let user = register_user(&app, input, &req.actor).await?;
    if let Some(session) = &req.session {
        session.login(user.id);
    }
    Ok(HttpResponse::Created().json(json!({ "userId": user.id })))
}
