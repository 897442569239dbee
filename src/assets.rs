use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::http::Surface;
use crate::settings::Settings;

/// A compiled frontend file plus its content fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAsset {
    pub content: String,
    pub revision: String,
}

impl CompiledAsset {
    fn new(content: String) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let revision = hex::encode(&digest[..4]);
        Self { content, revision }
    }
}

/// On-disk cache of compiled per-surface frontend assets.
#[derive(Debug, Clone)]
pub struct FrontendAssets {
    dir: PathBuf,
}

impl FrontendAssets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn css_path(&self, surface: Surface) -> PathBuf {
        self.dir.join(format!("{}.css", surface.as_str()))
    }

    pub fn is_css_cached(&self, surface: Surface) -> bool {
        self.css_path(surface).is_file()
    }

    /// Cached stylesheet for `surface`, compiling it on a miss.
    pub fn css<F>(&self, surface: Surface, compile: F) -> io::Result<CompiledAsset>
    where
        F: FnOnce() -> String,
    {
        let path = self.css_path(surface);
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Ok(CompiledAsset::new(content));
        }
        let content = compile();
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, &content)?;
        debug!("compiled {}", path.display());
        Ok(CompiledAsset::new(content))
    }

    pub fn flush_css(&self, surface: Surface) {
        let path = self.css_path(surface);
        if std::fs::remove_file(&path).is_ok() {
            info!("flushed {}", path.display());
        }
    }

    /// Drop every cached file belonging to `surface`.
    pub fn flush(&self, surface: Surface) {
        let prefix = format!("{}.", surface.as_str());
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        info!("flushed {} assets", surface.as_str());
    }

    pub fn flush_all(&self) {
        for surface in [Surface::Forum, Surface::Admin] {
            self.flush(surface);
        }
    }
}

/// Build the site stylesheet from theme settings.
pub fn compile_stylesheet(settings: &Settings) -> String {
    let primary = settings.get_or("theme_primary_color", "#4D698E");
    let secondary = settings.get_or("theme_secondary_color", "#4D698E");
    let mut css = format!(":root {{ --primary-color: {primary}; --secondary-color: {secondary}; }}\n");
    if settings.get("theme_dark_mode").as_deref() == Some("1") {
        css.push_str("body { background: #111; color: #eee; }\n");
    }
    if let Some(custom) = settings.get("custom_less") {
        css.push_str(&custom);
        css.push('\n');
    }
    css
}
