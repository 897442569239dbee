#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::cookie::Cookie;
use actix_web::dev::ServiceResponse;
use actix_web::web;
use ember::config::{Config, DatabaseConfig, Paths};
use ember::extensions::ExtenderSet;
use ember::http::server::Server;
use ember::install::{install, AdminUser, InstallData};
use ember::site::{Application, InstalledSite};
use tempfile::TempDir;

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_EMAIL: &str = "admin@forum.test";
pub const ADMIN_PASSWORD: &str = "correct horse battery";

/// A freshly installed site living in its own temp directory.
pub struct TestSite {
    _dir: TempDir,
    pub paths: Paths,
}

pub fn empty_paths() -> (TempDir, Paths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("config.json"), dir.path().join("storage"));
    (dir, paths)
}

pub async fn install_site() -> TestSite {
    let (dir, paths) = empty_paths();
    install(
        &paths,
        InstallData {
            forum_title: "Test Forum".into(),
            base_url: "http://localhost:8080".into(),
            debug: false,
            database: DatabaseConfig::default(),
            admin: AdminUser {
                username: ADMIN_USERNAME.into(),
                email: ADMIN_EMAIL.into(),
                password: ADMIN_PASSWORD.into(),
            },
            settings: HashMap::new(),
        },
    )
    .await
    .unwrap();
    TestSite { _dir: dir, paths }
}

impl TestSite {
    pub fn config(&self) -> Config {
        Config::load(&self.paths.config).unwrap()
    }

    pub fn update_config<F: FnOnce(&mut Config)>(&self, f: F) {
        let mut config = self.config();
        f(&mut config);
        config.save(&self.paths.config).unwrap();
    }

    pub async fn server(&self, extenders: ExtenderSet) -> web::Data<Server> {
        web::Data::new(Server::boot(self.paths.clone(), extenders).await.unwrap())
    }

    pub async fn boot(&self) -> Arc<Application> {
        InstalledSite::new(self.paths.clone(), self.config()).boot().await.unwrap()
    }
}

/// Build an actix test service around a booted [`Server`].
macro_rules! service {
    ($server:expr) => {
        actix_web::test::init_service(
            actix_web::App::new().app_data($server.clone()).configure(ember::http_config),
        )
        .await
    };
}

/// Log in through `POST /api/token` and return the bearer token.
macro_rules! token_for {
    ($app:expr, $identification:expr, $password:expr) => {{
        let req = actix_web::test::TestRequest::post()
            .uri("/api/token")
            .set_json(serde_json::json!({ "identification": $identification, "password": $password }))
            .to_request();
        let resp = actix_web::test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 200);
        let body = $crate::common::json_body(resp).await;
        body["token"].as_str().unwrap().to_string()
    }};
}

pub fn cookie_named<B>(resp: &ServiceResponse<B>, name: &str) -> Option<Cookie<'static>> {
    resp.response().cookies().find(|c| c.name() == name).map(|c| c.into_owned())
}

pub async fn json_body<B: actix_web::body::MessageBody>(resp: ServiceResponse<B>) -> serde_json::Value {
    let body = actix_web::test::read_body(resp).await;
    serde_json::from_slice(&body).unwrap()
}
