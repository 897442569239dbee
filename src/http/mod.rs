//! Request pipeline primitives.
//!
//! A request travels through a [`MiddlewarePipe`]: every stage gets the
//! request plus a [`Next`] continuation and either answers itself or hands the
//! request on. Pipes nest, so a whole surface pipeline can be mounted as one
//! stage under a path prefix with [`path`].

pub mod middleware;
pub mod routes;
pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use actix_web::http::Method;
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Actor;
use crate::error::{AppError, AppResult};
use crate::locale::FALLBACK_LOCALE;
use crate::session::SessionHandle;

/// One independently routed part of the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Forum,
    Admin,
    Api,
    Install,
    Update,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Forum => "forum",
            Surface::Admin => "admin",
            Surface::Api => "api",
            Surface::Install => "install",
            Surface::Update => "update",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight request state threaded through a pipeline.
pub struct ServerRequest {
    http: HttpRequest,
    pub method: Method,
    /// Path relative to the innermost mounted prefix.
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Bytes,
    pub parsed_body: Option<Value>,
    pub route_params: HashMap<String, String>,
    pub session: Option<SessionHandle>,
    pub actor: Actor,
    pub locale: String,
    pub errors: Vec<String>,
}

impl ServerRequest {
    pub fn new(http: HttpRequest, body: Bytes) -> Self {
        let query = web::Query::<HashMap<String, String>>::from_query(http.query_string())
            .map(|q| q.into_inner())
            .unwrap_or_default();
        Self {
            method: http.method().clone(),
            path: http.path().to_string(),
            query,
            body,
            parsed_body: None,
            route_params: HashMap::new(),
            session: None,
            actor: Actor::guest(),
            locale: FALLBACK_LOCALE.to_string(),
            errors: Vec::new(),
            http,
        }
    }

    pub fn http(&self) -> &HttpRequest {
        &self.http
    }

    /// Full request path, untouched by prefix stripping.
    pub fn uri_path(&self) -> &str {
        self.http.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.http.headers().get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.http.cookie(name).map(|c| c.value().to_string())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn wants_json(&self) -> bool {
        let is = |h: &str| self.header(h).map(|v| v.contains("json")).unwrap_or(false);
        is("accept") || is("content-type")
    }

    /// Deserialize the request body: parsed JSON, url-encoded form, or raw JSON.
    pub fn input<T: DeserializeOwned>(&self) -> AppResult<T> {
        if let Some(value) = &self.parsed_body {
            return serde_json::from_value(value.clone()).map_err(|e| AppError::BadRequest(e.to_string()));
        }
        let is_form = self
            .header("content-type")
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            let body = std::str::from_utf8(&self.body).map_err(|e| AppError::BadRequest(e.to_string()))?;
            return web::Query::<T>::from_query(body)
                .map(|q| q.into_inner())
                .map_err(|e| AppError::BadRequest(e.to_string()));
        }
        if self.body.is_empty() {
            return Err(AppError::BadRequest("request body is required".into()));
        }
        serde_json::from_slice(&self.body).map_err(|e| AppError::BadRequest(e.to_string()))
    }
}

/// Terminal request handler (controllers, whole pipelines).
#[async_trait(?Send)]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse>;
}

/// A pipeline stage.
#[async_trait(?Send)]
pub trait Middleware: Send + Sync {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse>;
}

/// Continuation over the remaining stages of a pipe.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    fallback: &'a dyn RequestHandler,
}

impl<'a> Next<'a> {
    pub fn new(stages: &'a [Arc<dyn Middleware>], fallback: &'a dyn RequestHandler) -> Self {
        Self { stages, fallback }
    }

    pub async fn run(self, req: ServerRequest) -> AppResult<HttpResponse> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.process(req, Next::new(rest, self.fallback)).await,
            None => self.fallback.handle(req).await,
        }
    }
}

#[async_trait(?Send)]
impl RequestHandler for Next<'_> {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        self.run(req).await
    }
}

/// Falls out of an exhausted top-level pipe.
struct EmptyPipeline;

#[async_trait(?Send)]
impl RequestHandler for EmptyPipeline {
    async fn handle(&self, _req: ServerRequest) -> AppResult<HttpResponse> {
        Err(AppError::RouteNotFound)
    }
}

/// Ordered list of stages; usable both as a handler and as a nested stage.
#[derive(Clone, Default)]
pub struct MiddlewarePipe {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipe<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.stages.push(Arc::new(middleware));
        self
    }
}

#[async_trait(?Send)]
impl RequestHandler for MiddlewarePipe {
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        Next::new(&self.stages, &EmptyPipeline).run(req).await
    }
}

#[async_trait(?Send)]
impl Middleware for MiddlewarePipe {
    async fn process(&self, req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        Next::new(&self.stages, &next).run(req).await
    }
}

/// Strip `prefix` from `path` on a segment boundary (case-insensitive).
pub fn strip_prefix(prefix: &str, path: &str) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Some(if path.is_empty() { "/".to_string() } else { path.to_string() });
    }
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &path[prefix.len()..];
    match rest {
        "" => Some("/".to_string()),
        r if r.starts_with('/') => Some(r.to_string()),
        _ => None,
    }
}

/// Mounts a stage under a path prefix.
pub struct PathPrefix {
    prefix: String,
    inner: Arc<dyn Middleware>,
}

pub fn path<M: Middleware + 'static>(prefix: &str, inner: M) -> PathPrefix {
    PathPrefix { prefix: prefix.to_string(), inner: Arc::new(inner) }
}

/// Hands a request back to the outer pipe with its original path.
struct RestorePath<'a> {
    original: String,
    next: Next<'a>,
}

#[async_trait(?Send)]
impl RequestHandler for RestorePath<'_> {
    async fn handle(&self, mut req: ServerRequest) -> AppResult<HttpResponse> {
        req.path = self.original.clone();
        self.next.run(req).await
    }
}

#[async_trait(?Send)]
impl Middleware for PathPrefix {
    async fn process(&self, mut req: ServerRequest, next: Next<'_>) -> AppResult<HttpResponse> {
        let Some(rest) = strip_prefix(&self.prefix, &req.path) else {
            return next.run(req).await;
        };
        let original = std::mem::replace(&mut req.path, rest);
        let restore = RestorePath { original, next };
        self.inner.process(req, Next::new(&[], &restore)).await
    }
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<HttpResponse>> + 'static,
{
    HandlerFn(f)
}

#[async_trait(?Send)]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<HttpResponse>> + 'static,
{
    async fn handle(&self, req: ServerRequest) -> AppResult<HttpResponse> {
        (self.0)(req).await
    }
}
