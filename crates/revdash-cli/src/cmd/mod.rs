//! Subcommand handlers. Each one opens the store, triggers a core
//! operation and renders the result.

pub mod admin;
pub mod dash;
pub mod jobs;
pub mod review;
pub mod show;
pub mod status;

use std::path::Path;

use revdash_core::App;
use revdash_core::config::load_config;
use revdash_core::jobs::{Registry, Runtime};
use revdash_core::runtime;

/// An opened application with its job registry.
pub struct Session {
    pub app: App,
    pub registry: Registry<App>,
}

/// Load configuration and open the store.
pub fn open_app(config: Option<&Path>) -> anyhow::Result<App> {
    let config = load_config(config)?;
    App::open(config)
}

/// Open the store and build the registry over its kinds.
pub fn open_session(config: Option<&Path>) -> anyhow::Result<Session> {
    let app = open_app(config)?;
    let registry = runtime::registry(app.config(), app.store().kinds())?;
    Ok(Session { app, registry })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_opens_the_configured_store() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("state/revdash.db");
        let config = dir.path().join("revdash.toml");
        std::fs::write(
            &config,
            format!("dev = true\n\n[store]\npath = {:?}\n", db.display().to_string()),
        )?;

        let session = open_session(Some(&config))?;
        assert!(session.app.config().dev);
        assert!(db.exists());
        let headings: Vec<String> = session
            .registry
            .status_report(&session.app)
            .into_iter()
            .map(|s| s.heading)
            .collect();
        assert!(headings.iter().any(|h| h == "codereview"));
        Ok(())
    }
}
