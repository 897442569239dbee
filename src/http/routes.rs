use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use actix_web::http::Method;
use actix_web::HttpResponse;
use async_trait::async_trait;

use super::{RequestHandler, ServerRequest};
use crate::error::AppResult;
use crate::site::Application;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

/// A named, method-bound route.
pub struct Route {
    pub method: Method,
    pub pattern: String,
    pub name: String,
    segments: Vec<Segment>,
    handler: Arc<dyn RequestHandler>,
}

impl Route {
    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler.clone()
    }
}

pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: HashMap<String, String>,
}

/// Ordered route table of one surface. Matching is case and method sensitive.
#[derive(Default)]
pub struct RouteCollection {
    routes: Vec<Route>,
}

impl RouteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, method: Method, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            name: name.to_string(),
            segments: parse_pattern(pattern),
            handler,
        });
        self
    }

    pub fn get(&mut self, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.add_route(Method::GET, pattern, name, handler)
    }

    pub fn post(&mut self, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.add_route(Method::POST, pattern, name, handler)
    }

    pub fn put(&mut self, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.add_route(Method::PUT, pattern, name, handler)
    }

    pub fn patch(&mut self, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.add_route(Method::PATCH, pattern, name, handler)
    }

    pub fn delete(&mut self, pattern: &str, name: &str, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.add_route(Method::DELETE, pattern, name, handler)
    }

    /// First route, in registration order, accepting `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter(|r| &r.method == method)
            .find_map(|route| route.matches(path).map(|params| RouteMatch { route, params }))
    }
}

/// Runs a controller with route parameters merged into the query (route wins).
pub struct ControllerRouteHandler<F> {
    app: Arc<Application>,
    controller: F,
}

pub fn controller<F, Fut>(app: &Arc<Application>, controller: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Arc<Application>, ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<HttpResponse>> + 'static,
{
    Arc::new(ControllerRouteHandler { app: app.clone(), controller })
}

#[async_trait(?Send)]
impl<F, Fut> RequestHandler for ControllerRouteHandler<F>
where
    F: Fn(Arc<Application>, ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<HttpResponse>> + 'static,
{
    async fn handle(&self, mut req: ServerRequest) -> AppResult<HttpResponse> {
        let params = req.route_params.clone();
        req.query.extend(params);
        (self.controller)(self.app.clone(), req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler_fn;

    fn ok() -> Arc<dyn RequestHandler> {
        Arc::new(handler_fn(|_req| async { Ok(HttpResponse::Ok().finish()) }))
    }

    fn table() -> RouteCollection {
        let mut routes = RouteCollection::new();
        routes
            .get("/", "index", ok())
            .get("/d/{id}", "discussion", ok())
            .post("/d/{id}", "discussion.reply", ok())
            .get("/u/{username}/posts", "user.posts", ok());
        routes
    }

    #[test]
    fn matches_by_method_and_captures_params() {
        let routes = table();
        let m = routes.find(&Method::GET, "/d/42").unwrap();
        assert_eq!(m.route.name, "discussion");
        assert_eq!(m.params["id"], "42");
        assert_eq!(routes.find(&Method::POST, "/d/42").unwrap().route.name, "discussion.reply");
        assert!(routes.find(&Method::DELETE, "/d/42").is_none());
        assert_eq!(routes.find(&Method::GET, "/").unwrap().route.name, "index");
    }

    #[test]
    fn literal_segments_are_case_sensitive() {
        let routes = table();
        assert!(routes.find(&Method::GET, "/D/42").is_none());
        assert!(routes.find(&Method::GET, "/u/toby/Posts").is_none());
        assert!(routes.find(&Method::GET, "/u/toby/posts").is_some());
    }
}
