//! Stages that make up the surface pipelines.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::Payload;
use actix_web::http::{Method, StatusCode};
use actix_web::{FromRequest, HttpResponse};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use tracing::{debug, error, warn};

use super::routes::RouteCollection;
use super::{Middleware, Next, ServerRequest};
use crate::auth::{Actor, TokenPurpose};
use crate::error::{AppError, AppResult};
use crate::models::RegistrationToken;
use crate::repo::RepoError;
use crate::site::Application;
use crate::views;

pub const REMEMBER_COOKIE: &str = "remember";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Json,
    Html,
}

/// Outermost stage: turns errors and panics from later stages into responses.
pub struct HandleErrors {
    format: ErrorFormat,
    debug: bool,
}

impl HandleErrors {
    pub fn new(format: ErrorFormat, debug: bool) -> Self {
        Self { format, debug }
    }

    /// Render `err` in the surface's format, or as JSON for clients asking for it.
    pub fn render(&self, err: &AppError, wants_json: bool) -> HttpResponse {
        let format = if wants_json { ErrorFormat::Json } else { self.format };
        match format {
            ErrorFormat::Json => err.to_json_response(self.debug),
            ErrorFormat::Html => {
                let status = err.status();
                let message = match err {
                    _ if self.debug => err.to_string(),
                    AppError::BadRequest(msg) | AppError::Validation(msg) => msg.clone(),
                    AppError::NotFound | AppError::RouteNotFound => "The page you requested was not found.".into(),
                    AppError::Unauthorized => "You need to log in to do that.".into(),
                    AppError::PermissionDenied => "You do not have permission to do that.".into(),
                    _ => "Something went wrong.".into(),
                };
                status_page(status, &message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    payload.downcast_ref::<String>().cloned().unwrap_or_else(|| "handler panicked".into())
}

#[async_trait(?Send)]
impl Middleware for HandleErrors {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        let method = req.method.clone();
        let path = req.uri_path().to_string();
        let wants_json = req.wants_json();
        let err = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(Ok(res)) => return Ok(res),
            Ok(Err(e)) => e,
            Err(panic) => AppError::Internal(panic_message(panic)),
        };
        if err.status().is_server_error() {
            error!(%method, %path, error = %err, "request failed");
        } else {
            debug!(%method, %path, error = %err, "request rejected");
        }
        Ok(self.render(&err, wants_json))
    }
}

/// Decodes JSON request bodies into [`ServerRequest::parsed_body`].
pub struct ParseJsonBody;

#[async_trait(?Send)]
impl Middleware for ParseJsonBody {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        let is_json = req.header("content-type").map(|ct| ct.contains("json")).unwrap_or(false);
        if is_json && !req.body.is_empty() {
            let value = serde_json::from_slice(&req.body)
                .map_err(|e| AppError::BadRequest(format!("malformed JSON body: {e}")))?;
            req.parsed_body = Some(value);
        }
        next.run(req).await
    }
}

/// Lets POST requests carry their real verb in `X-HTTP-Method-Override`.
pub struct FakeHttpMethods;

#[async_trait(?Send)]
impl Middleware for FakeHttpMethods {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if req.method == Method::POST {
            let overridden = req
                .header("x-http-method-override")
                .and_then(|m| Method::from_bytes(m.trim().to_uppercase().as_bytes()).ok());
            if let Some(method) = overridden {
                req.method = method;
            }
        }
        next.run(req).await
    }
}

/// Occasionally purges expired sessions and registration tokens.
pub struct CollectGarbage {
    app: Arc<Application>,
    lottery: (u32, u32),
}

impl CollectGarbage {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone(), lottery: (2, 100) }
    }

    pub fn with_lottery(mut self, chances: u32, out_of: u32) -> Self {
        self.lottery = (chances, out_of.max(1));
        self
    }

    fn hit(&self) -> bool {
        rand::thread_rng().gen_range(0..self.lottery.1) < self.lottery.0
    }
}

#[async_trait(?Send)]
impl Middleware for CollectGarbage {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if self.hit() {
            let now = Utc::now();
            let sessions = self.app.sessions.purge_expired(now);
            match self.app.repo.purge_registration_tokens(now - RegistrationToken::ttl()).await {
                Ok(tokens) => debug!(sessions, tokens, "collected garbage"),
                Err(e) => warn!(error = %e, "registration token purge failed"),
            }
        }
        next.run(req).await
    }
}

/// Resumes or opens the cookie-bound session.
///
/// The cookie is only sent once the session holds something.
pub struct StartSession {
    app: Arc<Application>,
}

impl StartSession {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone() }
    }
}

#[async_trait(?Send)]
impl Middleware for StartSession {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        let cookie_name = self.app.config.session.cookie.clone();
        let session = self.app.sessions.start(req.cookie(&cookie_name).as_deref());
        req.session = Some(session.clone());

        let mut res = next.run(req).await?;
        // Login and logout may have moved the session to a new id.
        if !session.is_stored() {
            return Ok(res);
        }
        let cookie = Cookie::build(cookie_name, session.id())
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::minutes(self.app.sessions.lifetime().num_minutes()))
            .finish();
        if let Err(e) = res.add_cookie(&cookie) {
            warn!(error = %e, "could not attach session cookie");
        }
        Ok(res)
    }
}

/// Logs the session in from a long-lived "remember me" cookie.
pub struct RememberFromCookie {
    app: Arc<Application>,
}

impl RememberFromCookie {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone() }
    }
}

#[async_trait(?Send)]
impl Middleware for RememberFromCookie {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if let (Some(session), Some(token)) = (&req.session, req.cookie(REMEMBER_COOKIE)) {
            if session.user_id().is_none() {
                match self.app.tokens.verify(&token, TokenPurpose::Remember) {
                    Ok(claims) => {
                        if let Some(id) = claims.user_id() {
                            session.login(id);
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring invalid remember cookie"),
                }
            }
        }
        next.run(req).await
    }
}

/// Resolves the actor from the session's user id.
pub struct AuthenticateWithSession {
    app: Arc<Application>,
}

impl AuthenticateWithSession {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone() }
    }
}

#[async_trait(?Send)]
impl Middleware for AuthenticateWithSession {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if let Some(session) = req.session.clone() {
            if let Some(id) = session.user_id() {
                match self.app.repo.get_user(id).await {
                    Ok(user) => req.actor = Actor::user(user),
                    Err(RepoError::NotFound) => session.logout(),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        next.run(req).await
    }
}

/// Resolves the actor from an `Authorization: Bearer` access token.
pub struct AuthenticateWithHeader {
    app: Arc<Application>,
}

impl AuthenticateWithHeader {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone() }
    }
}

#[async_trait(?Send)]
impl Middleware for AuthenticateWithHeader {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if let Ok(bearer) = BearerAuth::from_request(req.http(), &mut Payload::None).into_inner() {
            let claims = self
                .app
                .tokens
                .verify(bearer.token(), TokenPurpose::Access)
                .map_err(|_| AppError::Unauthorized)?;
            let id = claims.user_id().ok_or(AppError::Unauthorized)?;
            let user = match self.app.repo.get_user(id).await {
                Ok(user) => user,
                Err(RepoError::NotFound) => return Err(AppError::Unauthorized),
                Err(e) => return Err(e.into()),
            };
            req.actor = Actor::user(user);
        }
        next.run(req).await
    }
}

/// Picks the request locale: user preference, `?locale=`, site default, fallback.
pub struct SetLocale {
    app: Arc<Application>,
}

impl SetLocale {
    pub fn new(app: &Arc<Application>) -> Self {
        Self { app: app.clone() }
    }
}

#[async_trait(?Send)]
impl Middleware for SetLocale {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        let preferred = req.actor.user.as_ref().and_then(|u| u.locale.clone());
        let requested = req.query.get("locale").cloned();
        let default = self.app.settings.get("default_locale");
        req.locale = self.app.locales().resolve([preferred.as_deref(), requested.as_deref()], default.as_deref());
        next.run(req).await
    }
}

/// Moves flashed errors out of the session onto the request.
pub struct ShareErrorsFromSession;

#[async_trait(?Send)]
impl Middleware for ShareErrorsFromSession {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        if let Some(session) = &req.session {
            req.errors = session.take_errors();
        }
        next.run(req).await
    }
}

/// Rejects any actor lacking the administrate ability.
pub struct RequireAdministrateAbility;

#[async_trait(?Send)]
impl Middleware for RequireAdministrateAbility {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        req.actor.assert_admin()?;
        next.run(req).await
    }
}

/// Terminal stage: hands the request to the matching route's handler.
pub struct DispatchRoute {
    routes: Arc<RouteCollection>,
}

impl DispatchRoute {
    pub fn new(routes: RouteCollection) -> Self {
        Self { routes: Arc::new(routes) }
    }

    pub fn routes(&self) -> &RouteCollection {
        &self.routes
    }
}

#[async_trait(?Send)]
impl Middleware for DispatchRoute {
    async fn process(&self, mut req: ServerRequest, _next: Next<'_>) -> AppResult<HttpResponse> {
        let found = self.routes.find(&req.method, &req.path).ok_or(AppError::RouteNotFound)?;
        let handler = found.route.handler();
        req.route_params = found.params;
        handler.handle(req).await
    }
}

pub fn status_page(status: StatusCode, message: &str) -> HttpResponse {
    let body = format!("<h1>{}</h1>\n<p>{}</p>", status.as_u16(), views::escape(message));
    views::html(status, views::page(status.canonical_reason().unwrap_or("Error"), "en", None, &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{handler_fn, MiddlewarePipe, RequestHandler};
    use actix_web::test::TestRequest;
    use actix_web::web::Bytes;

    fn pipe_with<M: Middleware + 'static>(stage: M, routes: RouteCollection) -> MiddlewarePipe {
        let mut pipe = MiddlewarePipe::new();
        pipe.pipe(stage).pipe(DispatchRoute::new(routes));
        pipe
    }

    fn echo_method() -> RouteCollection {
        let mut routes = RouteCollection::new();
        let h = Arc::new(handler_fn(|req: ServerRequest| async move {
            Ok(HttpResponse::Ok().body(req.method.to_string()))
        }));
        routes.patch("/thing", "thing.update", h.clone()).post("/thing", "thing.create", h);
        routes
    }

    #[actix_web::test]
    async fn method_override_applies_to_post_only() {
        let pipe = pipe_with(FakeHttpMethods, echo_method());
        let http = TestRequest::post()
            .uri("/thing")
            .insert_header(("X-HTTP-Method-Override", "patch"))
            .to_http_request();
        let res = pipe.handle(ServerRequest::new(http, Bytes::new())).await.unwrap();
        let body = actix_web::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&body[..], b"PATCH");
    }

    #[actix_web::test]
    async fn unmatched_route_is_not_found() {
        let pipe = pipe_with(FakeHttpMethods, echo_method());
        let http = TestRequest::get().uri("/thing").to_http_request();
        let err = pipe.handle(ServerRequest::new(http, Bytes::new())).await.unwrap_err();
        assert!(matches!(err, AppError::RouteNotFound));
    }

    #[actix_web::test]
    async fn malformed_json_is_a_bad_request() {
        let pipe = pipe_with(ParseJsonBody, echo_method());
        let http = TestRequest::post()
            .uri("/thing")
            .insert_header(("content-type", "application/json"))
            .to_http_request();
        let err = pipe.handle(ServerRequest::new(http, Bytes::from_static(b"{oops"))).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[actix_web::test]
    async fn errors_and_panics_become_responses() {
        let mut routes = RouteCollection::new();
        routes.get(
            "/boom",
            "boom",
            Arc::new(handler_fn(|_req| async {
                let missing: Option<&str> = None;
                Ok(HttpResponse::Ok().body(missing.expect("kaboom")))
            })),
        );
        let pipe = pipe_with(HandleErrors::new(ErrorFormat::Json, true), routes);

        let http = TestRequest::get().uri("/boom").to_http_request();
        let res = pipe.handle(ServerRequest::new(http, Bytes::new())).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = actix_web::body::to_bytes(res.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["errors"][0]["detail"].as_str().unwrap().contains("kaboom"));

        let http = TestRequest::get().uri("/missing").to_http_request();
        let res = pipe.handle(ServerRequest::new(http, Bytes::new())).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn html_errors_hide_internals_outside_debug() {
        let stage = HandleErrors::new(ErrorFormat::Html, false);
        let res = stage.render(&AppError::Internal("secret".into()), false);
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = actix_web::body::to_bytes(res.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("secret"));
        assert!(text.contains("500"));
    }

    #[actix_web::test]
    async fn html_surface_answers_json_clients_in_json() {
        let pipe = pipe_with(HandleErrors::new(ErrorFormat::Html, false), RouteCollection::new());
        let http = TestRequest::get().uri("/nowhere").insert_header(("accept", "application/json")).to_http_request();
        let res = pipe.handle(ServerRequest::new(http, Bytes::new())).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = actix_web::body::to_bytes(res.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["status"], "404");
    }
}
