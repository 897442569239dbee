//! Hooks through which extensions customise pipelines, routes and listeners.

use std::sync::Arc;

use tracing::info;

use crate::error::{AppError, AppResult};
use crate::events::{Dispatcher, Event};
use crate::http::routes::RouteCollection;
use crate::http::{MiddlewarePipe, Surface};
use crate::locale::LocaleManager;
use crate::settings::Settings;
use crate::site::Application;

/// Setting holding the JSON array of enabled extension names.
pub const ENABLED_KEY: &str = "extensions_enabled";

/// Customisation applied while a site boots. Every hook defaults to a no-op.
pub trait Extender: Send + Sync {
    /// Runs after the built-in stages of `surface`, before route dispatch.
    fn configure_middleware(&self, _pipe: &mut MiddlewarePipe, _surface: Surface, _app: &Arc<Application>) {}

    /// Runs after the built-in routes of `surface` are registered.
    fn configure_routes(&self, _routes: &mut RouteCollection, _surface: Surface, _app: &Arc<Application>) {}

    fn subscribe(&self, _events: &Dispatcher) {}

    /// Registers the locales a language pack provides.
    fn configure_locales(&self, _locales: &mut LocaleManager) {}
}

/// Extenders known to a site: unconditional ones plus named, toggleable extensions.
#[derive(Clone, Default)]
pub struct ExtenderSet {
    always: Vec<Arc<dyn Extender>>,
    extensions: Vec<(String, Arc<dyn Extender>)>,
}

impl ExtenderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extender that applies regardless of settings.
    pub fn extend<E: Extender + 'static>(mut self, extender: E) -> Self {
        self.always.push(Arc::new(extender));
        self
    }

    /// Register a named extension; it applies only while enabled.
    pub fn extension<E: Extender + 'static>(mut self, name: &str, extender: E) -> Self {
        self.extensions.push((name.to_string(), Arc::new(extender)));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.extensions.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Unconditional extenders followed by the enabled extensions, in registration order.
    pub fn active(&self, enabled: &[String]) -> Vec<Arc<dyn Extender>> {
        let named = self
            .extensions
            .iter()
            .filter(|(name, _)| enabled.contains(name))
            .map(|(_, e)| e.clone());
        self.always.iter().cloned().chain(named).collect()
    }
}

/// Tracks which registered extensions are enabled.
pub struct ExtensionManager {
    available: Vec<String>,
}

impl ExtensionManager {
    pub fn new(available: Vec<String>) -> Self {
        Self { available }
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    /// Names stored in the enabled setting; malformed values count as none.
    pub fn enabled(settings: &Settings) -> Vec<String> {
        settings
            .get(ENABLED_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, settings: &Settings, name: &str) -> bool {
        Self::enabled(settings).iter().any(|n| n == name)
    }

    pub async fn enable(&self, settings: &Settings, events: &Dispatcher, name: &str) -> AppResult<()> {
        self.ensure_known(name)?;
        let mut enabled = Self::enabled(settings);
        if enabled.iter().any(|n| n == name) {
            return Ok(());
        }
        enabled.push(name.to_string());
        self.store(settings, &enabled).await?;
        info!(extension = name, "extension enabled");
        events.dispatch(&Event::ExtensionEnabled(name.to_string()));
        Ok(())
    }

    pub async fn disable(&self, settings: &Settings, events: &Dispatcher, name: &str) -> AppResult<()> {
        self.ensure_known(name)?;
        let mut enabled = Self::enabled(settings);
        let before = enabled.len();
        enabled.retain(|n| n != name);
        if enabled.len() == before {
            return Ok(());
        }
        self.store(settings, &enabled).await?;
        info!(extension = name, "extension disabled");
        events.dispatch(&Event::ExtensionDisabled(name.to_string()));
        Ok(())
    }

    fn ensure_known(&self, name: &str) -> AppResult<()> {
        if self.available.iter().any(|n| n == name) {
            Ok(())
        } else {
            Err(AppError::NotFound)
        }
    }

    async fn store(&self, settings: &Settings, enabled: &[String]) -> AppResult<()> {
        let raw = serde_json::to_string(enabled).map_err(|e| AppError::Internal(e.to_string()))?;
        settings.set(ENABLED_KEY, &raw).await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;
    use crate::repo::inmem::InMemRepo;
    use crate::repo::Repo;
    use std::sync::Mutex;

    struct Noop;
    impl Extender for Noop {}

    #[test]
    fn active_set_respects_enabled_names() {
        let set = ExtenderSet::new().extend(Noop).extension("tags", Noop).extension("likes", Noop);
        assert_eq!(set.names(), vec!["tags", "likes"]);
        assert_eq!(set.active(&[]).len(), 1);
        assert_eq!(set.active(&["likes".to_string()]).len(), 2);
    }

    #[tokio::test]
    async fn enabling_persists_and_announces() {
        let repo: Arc<dyn Repo> = Arc::new(InMemRepo::ephemeral());
        let events = Arc::new(Dispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            events.listen(move |e| {
                if !matches!(e, Event::SettingSaved { .. }) {
                    seen.lock().unwrap().push(e.clone());
                }
            });
        }
        let settings = Settings::new(repo, events.clone());
        let manager = ExtensionManager::new(vec!["tags".into()]);

        manager.enable(&settings, &events, "tags").await.unwrap();
        manager.enable(&settings, &events, "tags").await.unwrap();
        assert!(manager.is_enabled(&settings, "tags"));
        manager.disable(&settings, &events, "tags").await.unwrap();
        assert!(!manager.is_enabled(&settings, "tags"));
        assert!(matches!(manager.enable(&settings, &events, "nope").await, Err(AppError::NotFound)));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::ExtensionEnabled("tags".into()), Event::ExtensionDisabled("tags".into())]
        );
    }
}
