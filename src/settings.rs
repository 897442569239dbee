use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::events::{Dispatcher, Event};
use crate::repo::{Repo, RepoError, RepoResult};

/// Keys whose change invalidates compiled stylesheets.
pub fn is_theme_key(key: &str) -> bool {
    let key = key.to_lowercase();
    key.starts_with("theme_") || key == "custom_less"
}

/// Read-through cache over the persisted settings table.
pub struct Settings {
    repo: Arc<dyn Repo>,
    events: Arc<Dispatcher>,
    cache: RwLock<HashMap<String, String>>,
}

impl Settings {
    pub fn new(repo: Arc<dyn Repo>, events: Arc<Dispatcher>) -> Self {
        Self { repo, events, cache: RwLock::new(HashMap::new()) }
    }

    /// (Re)load every setting from the store.
    pub async fn load(&self) -> RepoResult<()> {
        let all = self.repo.all_settings().await?;
        *self.cache.write().map_err(|_| poisoned())? = all;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.read().ok()?.get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.cache.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Persist a value and announce it with [`Event::SettingSaved`].
    pub async fn set(&self, key: &str, value: &str) -> RepoResult<()> {
        self.repo.set_setting(key, value).await?;
        self.cache.write().map_err(|_| poisoned())?.insert(key.to_string(), value.to_string());
        self.events.dispatch(&Event::SettingSaved { key: key.to_string(), value: value.to_string() });
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> RepoResult<()> {
        self.repo.delete_setting(key).await?;
        self.cache.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}

fn poisoned() -> RepoError {
    RepoError::Internal("settings cache lock poisoned".into())
}

/// Outgoing mail configuration seeded from settings at boot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MailConfig {
    pub driver: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub encryption: Option<String>,
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            driver: "mail".into(),
            host: None,
            port: None,
            from_address: None,
            from_name: None,
            encryption: None,
            username: None,
            password: None,
        }
    }
}

impl MailConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let non_empty = |key: &str| settings.get(key).filter(|v| !v.is_empty());
        Self {
            driver: non_empty("mail_driver").unwrap_or_else(|| "mail".into()),
            host: non_empty("mail_host"),
            port: non_empty("mail_port").and_then(|p| p.parse().ok()),
            from_address: non_empty("mail_from"),
            from_name: non_empty("forum_title"),
            encryption: non_empty("mail_encryption"),
            username: non_empty("mail_username"),
            password: non_empty("mail_password"),
        }
    }
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;
    use crate::repo::inmem::InMemRepo;
    use std::sync::Mutex;

    #[test]
    fn theme_keys() {
        assert!(is_theme_key("theme_primary_color"));
        assert!(is_theme_key("THEME_dark_mode"));
        assert!(is_theme_key("custom_less"));
        assert!(!is_theme_key("custom_less_extra"));
        assert!(!is_theme_key("forum_title"));
    }

    #[tokio::test]
    async fn set_writes_through_and_emits() {
        let events = Arc::new(Dispatcher::new());
        let saved = Arc::new(Mutex::new(Vec::new()));
        {
            let saved = saved.clone();
            events.listen(move |e| {
                if let Event::SettingSaved { key, .. } = e {
                    saved.lock().unwrap().push(key.clone());
                }
            });
        }
        let repo: Arc<dyn Repo> = Arc::new(InMemRepo::ephemeral());
        let settings = Settings::new(repo.clone(), events);
        settings.set("forum_title", "Ember").await.unwrap();
        assert_eq!(settings.get("forum_title").as_deref(), Some("Ember"));
        assert_eq!(repo.all_settings().await.unwrap()["forum_title"], "Ember");
        assert_eq!(*saved.lock().unwrap(), vec!["forum_title"]);
    }

    #[tokio::test]
    async fn mail_config_from_settings() {
        let repo: Arc<dyn Repo> = Arc::new(InMemRepo::ephemeral());
        repo.set_setting("mail_driver", "smtp").await.unwrap();
        repo.set_setting("mail_port", "587").await.unwrap();
        repo.set_setting("forum_title", "Ember").await.unwrap();
        repo.set_setting("mail_host", "").await.unwrap();
        let settings = Settings::new(repo, Arc::new(Dispatcher::new()));
        settings.load().await.unwrap();
        let mail = MailConfig::from_settings(&settings);
        assert_eq!(mail.driver, "smtp");
        assert_eq!(mail.port, Some(587));
        assert_eq!(mail.from_name.as_deref(), Some("Ember"));
        assert_eq!(mail.host, None);
    }
}
