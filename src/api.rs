//! JSON:API surface.

use std::sync::Arc;

use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::auth::{verify_password, Actor, TokenPurpose};
use crate::error::{AppError, AppResult};
use crate::http::middleware::{
    AuthenticateWithHeader, AuthenticateWithSession, DispatchRoute, ErrorFormat, FakeHttpMethods, HandleErrors,
    ParseJsonBody, RememberFromCookie, SetLocale, StartSession,
};
use crate::http::routes::{controller, RouteCollection};
use crate::http::{MiddlewarePipe, ServerRequest, Surface};
use crate::models::{Discussion, Id, NewDiscussion, User};
use crate::registration::{register_user, Registration};
use crate::site::Application;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 50;

pub fn routes(app: &Arc<Application>) -> RouteCollection {
    let mut routes = RouteCollection::new();
    routes
        .get("/", "forum.show", controller(app, show_forum))
        .get("/discussions", "discussions.index", controller(app, list_discussions))
        .post("/discussions", "discussions.create", controller(app, create_discussion))
        .get("/discussions/{id}", "discussions.show", controller(app, show_discussion))
        .post("/users", "users.create", controller(app, create_user))
        .get("/users/{id}", "users.show", controller(app, show_user))
        .post("/token", "token", controller(app, create_token))
        .post("/settings", "settings", controller(app, save_settings))
        .patch("/extensions/{name}", "extensions.update", controller(app, update_extension))
        .delete("/cache", "cache.clear", controller(app, clear_cache));
    for extender in app.extenders() {
        extender.configure_routes(&mut routes, Surface::Api, app);
    }
    routes
}

pub fn middleware(app: &Arc<Application>) -> MiddlewarePipe {
    let mut pipe = MiddlewarePipe::new();
    pipe.pipe(HandleErrors::new(ErrorFormat::Json, app.in_debug_mode()))
        .pipe(ParseJsonBody)
        .pipe(FakeHttpMethods)
        .pipe(StartSession::new(app))
        .pipe(RememberFromCookie::new(app))
        .pipe(AuthenticateWithSession::new(app))
        .pipe(AuthenticateWithHeader::new(app))
        .pipe(SetLocale::new(app));
    for extender in app.extenders() {
        extender.configure_middleware(&mut pipe, Surface::Api, app);
    }
    pipe.pipe(DispatchRoute::new(routes(app)));
    pipe
}

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: Resource<T>,
}

#[derive(Debug, Deserialize)]
struct Resource<T> {
    attributes: T,
}

fn discussion_resource(d: &Discussion) -> Value {
    json!({
        "type": "discussions",
        "id": d.id.to_string(),
        "attributes": {
            "title": d.title,
            "content": d.content,
            "createdAt": d.created_at,
            "lastPostedAt": d.last_posted_at,
        },
        "relationships": {
            "user": { "data": { "type": "users", "id": d.author_id.to_string() } }
        }
    })
}

fn user_resource(u: &User, actor: &Actor) -> Value {
    let mut attributes = json!({
        "username": u.username,
        "joinedAt": u.joined_at,
    });
    let is_self = actor.user.as_ref().map(|a| a.id == u.id).unwrap_or(false);
    if is_self || actor.is_admin() {
        attributes["email"] = json!(u.email);
        attributes["isEmailConfirmed"] = json!(u.is_email_confirmed);
        attributes["role"] = json!(u.role);
    }
    json!({ "type": "users", "id": u.id.to_string(), "attributes": attributes })
}

fn id_param(req: &ServerRequest) -> AppResult<Id> {
    req.query_param("id").and_then(|id| id.parse().ok()).ok_or(AppError::NotFound)
}

async fn show_forum(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let s = &app.settings;
    let mut attributes = json!({
        "title": s.get_or("forum_title", ""),
        "description": s.get_or("forum_description", ""),
        "baseUrl": app.config.url_for(Surface::Forum),
        "basePath": app.config.base_path()?,
        "apiUrl": app.config.url_for(Surface::Api),
        "welcomeTitle": s.get_or("welcome_title", ""),
        "welcomeMessage": s.get_or("welcome_message", ""),
        "allowSignUp": s.get("allow_sign_up").as_deref() == Some("1"),
        "defaultRoute": s.get_or("default_route", "/all"),
        "locales": app.locales().locales(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if req.actor.is_admin() {
        attributes["adminUrl"] = json!(app.config.url_for(Surface::Admin));
        attributes["debug"] = json!(app.config.debug);
    }
    Ok(HttpResponse::Ok().json(json!({ "data": { "type": "forums", "id": "1", "attributes": attributes } })))
}

async fn list_discussions(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let limit = req
        .query_param("page[limit]")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = req.query_param("page[offset]").and_then(|v| v.parse().ok()).unwrap_or(0);
    let discussions = app.repo.list_discussions(limit, offset).await?;
    let data: Vec<Value> = discussions.iter().map(discussion_resource).collect();
    Ok(HttpResponse::Ok().json(json!({ "data": data })))
}

#[derive(Debug, Deserialize)]
struct DiscussionAttributes {
    title: String,
    #[serde(default)]
    content: String,
}

async fn create_discussion(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let author = req.actor.assert_registered()?;
    let doc: Document<DiscussionAttributes> = req.input()?;
    let title = doc.data.attributes.title.trim().to_string();
    if title.is_empty() || title.chars().count() > 80 {
        return Err(AppError::Validation("title must be between 1 and 80 characters".into()));
    }
    let discussion = app
        .repo
        .create_discussion(NewDiscussion { title, content: doc.data.attributes.content, author_id: author.id })
        .await?;
    info!(discussion_id = discussion.id, user_id = author.id, "discussion started");
    Ok(HttpResponse::Created().json(json!({ "data": discussion_resource(&discussion) })))
}

async fn show_discussion(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let discussion = app.repo.get_discussion(id_param(&req)?).await?;
    Ok(HttpResponse::Ok().json(json!({ "data": discussion_resource(&discussion) })))
}

async fn create_user(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let doc: Document<Registration> = req.input()?;
    let user = register_user(&app, doc.data.attributes, &req.actor).await?;
    let viewer = if req.actor.is_guest() { Actor::user(user.clone()) } else { req.actor.clone() };
    Ok(HttpResponse::Created().json(json!({ "data": user_resource(&user, &viewer) })))
}

async fn show_user(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let user = app.repo.get_user(id_param(&req)?).await?;
    Ok(HttpResponse::Ok().json(json!({ "data": user_resource(&user, &req.actor) })))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    identification: String,
    password: String,
}

async fn create_token(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    let input: TokenRequest = req.input()?;
    let user = app
        .repo
        .find_user_by_login(&input.identification)
        .await?
        .filter(|u| verify_password(&input.password, &u.password_hash))
        .ok_or(AppError::Unauthorized)?;
    let token = app
        .tokens
        .issue(&user, TokenPurpose::Access)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok().json(json!({ "token": token, "userId": user.id.to_string() })))
}

fn setting_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

async fn save_settings(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    req.actor.assert_admin()?;
    let values: Map<String, Value> = req.input()?;
    for (key, value) in &values {
        match setting_value(value) {
            Some(v) => app.settings.set(key, &v).await?,
            None => app.settings.delete(key).await?,
        }
    }
    info!(count = values.len(), "settings saved");
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct ExtensionToggle {
    enabled: bool,
}

async fn update_extension(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    req.actor.assert_admin()?;
    let name = req.query_param("name").ok_or(AppError::NotFound)?.to_string();
    let toggle: ExtensionToggle = req.input()?;
    if toggle.enabled {
        app.extensions.enable(&app.settings, &app.events, &name).await?;
    } else {
        app.extensions.disable(&app.settings, &app.events, &name).await?;
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn clear_cache(app: Arc<Application>, req: ServerRequest) -> AppResult<HttpResponse> {
    req.actor.assert_admin()?;
    app.clear_cache();
    info!("cache cleared");
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use chrono::Utc;

    fn user(id: Id, role: Role) -> User {
        User {
            id,
            username: format!("user{id}"),
            email: format!("user{id}@example.com"),
            password_hash: "secret-hash".into(),
            role,
            locale: None,
            is_email_confirmed: false,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn email_is_private_to_owner_and_admins() {
        let target = user(1, Role::User);
        let public = user_resource(&target, &Actor::guest());
        assert!(public["attributes"].get("email").is_none());
        let own = user_resource(&target, &Actor::user(target.clone()));
        assert_eq!(own["attributes"]["email"], "user1@example.com");
        let admin = user_resource(&target, &Actor::user(user(2, Role::Admin)));
        assert_eq!(admin["attributes"]["email"], "user1@example.com");
        assert!(own.to_string().find("secret-hash").is_none());
    }

    #[test]
    fn setting_values_are_stringified() {
        assert_eq!(setting_value(&json!("x")).as_deref(), Some("x"));
        assert_eq!(setting_value(&json!(true)).as_deref(), Some("1"));
        assert_eq!(setting_value(&json!(42)).as_deref(), Some("42"));
        assert_eq!(setting_value(&Value::Null), None);
    }
}
