use crate::schema::Config;
use arc_swap::ArcSwap;
use std::{path::PathBuf, sync::Arc};

/// Watches a configuration file for changes and hot-reloads on modification.
///
/// Only the static key list is meant to change at runtime; listener and
/// timeout settings are read once at startup.
pub struct ConfigWatcher {
    /// Current configuration, atomically swappable.
    current: Arc<ArcSwap<Config>>,
    /// Path to the configuration file.
    path: PathBuf,
}

impl ConfigWatcher {
    /// Creates a new watcher from a file path, loading the initial configuration immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the configuration file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn new(path: PathBuf) -> Result<Self, figment::Error> {
        let config = Config::load(Some(&path))?;
        Ok(Self::with_config(path, config))
    }

    /// Creates a watcher seeded with an already-loaded configuration.
    #[must_use]
    pub fn with_config(path: PathBuf, config: Config) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            path,
        }
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn load(&self) -> arc_swap::Guard<Arc<Config>> {
        self.current.load()
    }

    /// Returns a shareable `ArcSwap` handle.
    #[must_use]
    pub fn arc(&self) -> Arc<ArcSwap<Config>> {
        Arc::clone(&self.current)
    }

    /// Manually reloads the configuration from disk (environment included).
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the configuration file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn reload(&self) -> Result<Arc<Config>, figment::Error> {
        let new_config = Arc::new(Config::load(Some(&self.path))?);
        self.current.store(Arc::clone(&new_config));
        Ok(new_config)
    }

    /// Starts background file watching (spawns a blocking tokio task) that
    /// reloads the configuration when the file changes and hands every
    /// successfully reloaded snapshot to `on_change`.
    pub fn watch<F>(self: Arc<Self>, on_change: F)
    where
        F: Fn(&Config) + Send + 'static,
    {
        use notify::{RecursiveMode, Watcher as _};
        let watcher_self = Arc::clone(&self);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let (tx, rx) = std::sync::mpsc::channel();
            let mut watcher =
                match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                    if res.is_ok() {
                        let _ = tx.send(());
                    }
                }) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(error = %e, "config watcher unavailable, hot reload disabled");
                        return;
                    }
                };

            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                tracing::warn!(path = %path.display(), error = %e, "cannot watch config file");
                return;
            }

            for () in rx {
                match watcher_self.reload() {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "configuration reloaded");
                        on_change(&config);
                    }
                    Err(e) => tracing::warn!(error = %e, "config reload failed, keeping previous"),
                }
            }
        });
    }
}
