use std::collections::BTreeMap;

pub const FALLBACK_LOCALE: &str = "en";

/// Registry of the locales the site can render.
#[derive(Debug, Clone)]
pub struct LocaleManager {
    locales: BTreeMap<String, String>,
}

impl Default for LocaleManager {
    fn default() -> Self {
        let mut manager = Self { locales: BTreeMap::new() };
        manager.add_locale(FALLBACK_LOCALE, "English");
        manager
    }
}

impl LocaleManager {
    pub fn add_locale(&mut self, code: &str, name: &str) {
        self.locales.insert(code.to_string(), name.to_string());
    }

    pub fn has_locale(&self, code: &str) -> bool {
        self.locales.contains_key(code)
    }

    pub fn locales(&self) -> &BTreeMap<String, String> {
        &self.locales
    }

    /// First available candidate, else `default`, else the fallback.
    pub fn resolve<'a, I>(&self, candidates: I, default: Option<&'a str>) -> String
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        candidates
            .into_iter()
            .flatten()
            .find(|c| self.has_locale(c))
            .or(default.filter(|d| self.has_locale(d)))
            .unwrap_or(FALLBACK_LOCALE)
            .to_string()
    }
}
