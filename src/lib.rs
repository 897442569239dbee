pub mod admin;
pub mod api;
pub mod assets;
pub mod auth;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod extensions;
pub mod forum;
pub mod http;
pub mod install;
pub mod locale;
pub mod models;
pub mod registration;
pub mod repo;
pub mod session;
pub mod settings;
pub mod site;
pub mod update;
pub mod views;

// Re-export commonly used items for tests / embedders
pub use extensions::{Extender, ExtenderSet};
pub use http::server::{config as http_config, Server};
pub use site::{select_mode, Application, InstalledApp, InstalledSite, Mode, Site};
