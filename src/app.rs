use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chan;
use crate::config;
use crate::data::{self, BoardService, CatalogService, ThreadService};
use crate::media;
use crate::settings::{SettingsStore, SqliteSettings};
use crate::storage;
use crate::ui;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;

    let store = storage::Store::open(storage::Options::default()).context("open storage")?;

    let media_cfg = media::Config {
        cache_dir: cfg.media.cache_dir.clone(),
        max_size_bytes: cfg.media.max_size_bytes,
        default_ttl: cfg.media.default_ttl,
        workers: cfg.media.workers,
        http_client: None,
    };
    let media_manager = media::Manager::new(store.clone(), media_cfg)
        .ok()
        .map(Arc::new);
    if let Some(manager) = &media_manager {
        let _ = manager.sweep_expired();
    }

    let user_agent = if !cfg.api.user_agent.trim().is_empty() {
        cfg.api.user_agent.clone()
    } else {
        format!("chan-tui/{}", crate::VERSION)
    };

    let client = Arc::new(
        chan::Client::new(chan::ClientConfig {
            user_agent,
            api_base: Some(cfg.api.api_base.clone()),
            media_base: Some(cfg.api.media_base.clone()),
            policy: cfg.fetch_policy(),
            http_client: None,
        })
        .context("build api client")?,
    );

    let boards: Arc<dyn BoardService> = Arc::new(data::ChanBoardService::new(client.clone()));
    let catalog_api: Arc<dyn CatalogService> =
        Arc::new(data::ChanCatalogService::new(client.clone()));
    let catalogs = Arc::new(data::CachedCatalogService::new(
        catalog_api,
        store.clone(),
        cfg.cache.catalog_ttl,
    ));
    let threads: Arc<dyn ThreadService> = Arc::new(data::ChanThreadService::new(client.clone()));
    let settings: Arc<dyn SettingsStore> = Arc::new(SqliteSettings::new(store.clone()));

    let options = ui::ModelOptions {
        boards,
        catalogs,
        threads,
        settings,
        media: media_manager,
        client,
        refresh_period: cfg.cache.refresh_period,
        theme: cfg.ui.theme.clone(),
    };

    let mut model = ui::Model::new(options);
    model.run()?;

    Ok(())
}
