use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chan::PostId;
use crate::storage::Store;

pub const SETTINGS_KEY: &str = "settings";

/// The one composite-key builder. Board codes never contain `:`, so the
/// format is unambiguous.
pub fn thread_key(board: &str, no: PostId) -> String {
    format!("{board}:{no}")
}

fn split_key(key: &str) -> Option<(&str, PostId)> {
    let (board, no) = key.split_once(':')?;
    Some((board, no.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auto_refresh: bool,
    pub hover_zoom: bool,
    pub show_ip: bool,
    pub high_contrast: bool,
    pub favorite_boards: Vec<String>,
    pub pinned_threads: Vec<String>,
    pub thread_tags: Vec<String>,
    pub tagged_threads: HashMap<String, Vec<String>>,
    pub watched_threads: HashMap<String, i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_refresh: false,
            hover_zoom: false,
            show_ip: false,
            high_contrast: false,
            favorite_boards: Vec::new(),
            pinned_threads: Vec::new(),
            thread_tags: Vec::new(),
            tagged_threads: HashMap::new(),
            watched_threads: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn is_favorite(&self, board: &str) -> bool {
        self.favorite_boards.iter().any(|b| b == board)
    }

    /// Returns the new state.
    pub fn toggle_favorite(&mut self, board: &str) -> bool {
        if let Some(pos) = self.favorite_boards.iter().position(|b| b == board) {
            self.favorite_boards.remove(pos);
            false
        } else {
            self.favorite_boards.push(board.to_string());
            true
        }
    }

    pub fn is_pinned(&self, board: &str, no: PostId) -> bool {
        let key = thread_key(board, no);
        self.pinned_threads.iter().any(|k| *k == key)
    }

    pub fn toggle_pin(&mut self, board: &str, no: PostId) -> bool {
        let key = thread_key(board, no);
        if let Some(pos) = self.pinned_threads.iter().position(|k| *k == key) {
            self.pinned_threads.remove(pos);
            false
        } else {
            self.pinned_threads.push(key);
            true
        }
    }

    /// Thread numbers pinned on one board.
    pub fn pinned_on(&self, board: &str) -> HashSet<PostId> {
        self.pinned_threads
            .iter()
            .filter_map(|key| split_key(key))
            .filter(|(b, _)| *b == board)
            .map(|(_, no)| no)
            .collect()
    }

    /// Returns false when the name is empty or already defined.
    pub fn define_tag(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || self.thread_tags.iter().any(|t| t == name) {
            return false;
        }
        self.thread_tags.push(name.to_string());
        true
    }

    /// Removes the tag everywhere; threads left with no tags drop their key.
    pub fn delete_tag(&mut self, name: &str) {
        self.thread_tags.retain(|t| t != name);
        self.tagged_threads.retain(|_, tags| {
            tags.retain(|t| t != name);
            !tags.is_empty()
        });
    }

    pub fn toggle_tag(&mut self, board: &str, no: PostId, tag: &str) -> bool {
        let key = thread_key(board, no);
        let tags = self.tagged_threads.entry(key.clone()).or_default();
        if let Some(pos) = tags.iter().position(|t| t == tag) {
            tags.remove(pos);
            if tags.is_empty() {
                self.tagged_threads.remove(&key);
            }
            false
        } else {
            tags.push(tag.to_string());
            true
        }
    }

    pub fn tags_for(&self, board: &str, no: PostId) -> Vec<String> {
        self.tagged_threads
            .get(&thread_key(board, no))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_watched(&self, board: &str, no: PostId) -> bool {
        self.watched_threads.contains_key(&thread_key(board, no))
    }

    /// Watching records the current newest post time so later checks only
    /// count genuinely new posts. Returns the new state.
    pub fn toggle_watch(&mut self, board: &str, no: PostId, newest_time: i64) -> bool {
        let key = thread_key(board, no);
        if self.watched_threads.remove(&key).is_some() {
            false
        } else {
            self.watched_threads.insert(key, newest_time);
            true
        }
    }

    pub fn watermark(&self, board: &str, no: PostId) -> Option<i64> {
        self.watched_threads.get(&thread_key(board, no)).copied()
    }

    /// Advance a watched thread's watermark; no-op for unwatched threads.
    pub fn set_watermark(&mut self, board: &str, no: PostId, newest_time: i64) {
        if let Some(mark) = self.watched_threads.get_mut(&thread_key(board, no)) {
            *mark = (*mark).max(newest_time);
        }
    }
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings persisted as one JSON blob in the kv table.
pub struct SqliteSettings {
    store: Store,
}

impl SqliteSettings {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl SettingsStore for SqliteSettings {
    fn load(&self) -> Result<Settings> {
        match self.store.get_kv(SETTINGS_KEY)? {
            // An unreadable blob starts the session on defaults rather than
            // refusing to launch.
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Settings::default()),
        }
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let raw = serde_json::to_string(settings).context("settings: encode")?;
        self.store.put_kv(SETTINGS_KEY, &raw)
    }
}

#[derive(Default)]
pub struct MemorySettings {
    inner: Mutex<Settings>,
}

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> Result<Settings> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        *self.inner.lock() = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Options;
    use tempfile::tempdir;

    #[test]
    fn thread_keys_are_board_colon_no() {
        assert_eq!(thread_key("g", 12345), "g:12345");
        assert_eq!(split_key("g:12345"), Some(("g", 12345)));
        assert_eq!(split_key("nonsense"), None);
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        let settings_store = SqliteSettings::new(store);

        let mut settings = Settings::default();
        settings.toggle_favorite("g");
        settings.toggle_pin("g", 100);
        settings.define_tag("read later");
        settings.toggle_tag("g", 100, "read later");
        settings.toggle_watch("g", 100, 1714000000);
        settings.show_ip = true;

        settings_store.save(&settings).unwrap();
        let loaded = settings_store.load().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_blob_and_garbage_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        let settings_store = SqliteSettings::new(store.clone());
        assert_eq!(settings_store.load().unwrap(), Settings::default());

        store.put_kv(SETTINGS_KEY, "{{{").unwrap();
        assert_eq!(settings_store.load().unwrap(), Settings::default());
    }

    #[test]
    fn partial_blob_merges_over_defaults() {
        let raw = "{\"favorite_boards\":[\"g\"],\"show_ip\":true}";
        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert!(settings.is_favorite("g"));
        assert!(settings.show_ip);
        assert!(!settings.auto_refresh);
        assert!(settings.pinned_threads.is_empty());
        assert!(settings.watched_threads.is_empty());
    }

    #[test]
    fn defaults_keep_background_features_off() {
        let settings = Settings::default();
        assert!(!settings.auto_refresh);
        assert!(!settings.hover_zoom);
        assert!(!settings.show_ip);
        assert!(!settings.high_contrast);
    }

    #[test]
    fn pinned_on_matches_exact_board() {
        let mut settings = Settings::default();
        settings.toggle_pin("g", 1);
        settings.toggle_pin("gif", 2);
        let on_g = settings.pinned_on("g");
        assert!(on_g.contains(&1));
        assert!(!on_g.contains(&2));
        assert!(settings.pinned_on("gif").contains(&2));
    }

    #[test]
    fn deleting_a_tag_strips_threads() {
        let mut settings = Settings::default();
        assert!(settings.define_tag("news"));
        assert!(settings.define_tag("tech"));
        assert!(!settings.define_tag("news"));
        assert!(!settings.define_tag("  "));

        settings.toggle_tag("g", 1, "news");
        settings.toggle_tag("g", 1, "tech");
        settings.toggle_tag("g", 2, "news");

        settings.delete_tag("news");
        assert_eq!(settings.thread_tags, vec!["tech".to_string()]);
        assert_eq!(settings.tags_for("g", 1), vec!["tech".to_string()]);
        assert!(settings.tags_for("g", 2).is_empty());
        assert!(!settings.tagged_threads.contains_key("g:2"));
    }

    #[test]
    fn untagging_last_tag_drops_the_key() {
        let mut settings = Settings::default();
        settings.define_tag("news");
        assert!(settings.toggle_tag("g", 1, "news"));
        assert!(!settings.toggle_tag("g", 1, "news"));
        assert!(!settings.tagged_threads.contains_key("g:1"));
    }

    #[test]
    fn watch_records_and_advances_watermark() {
        let mut settings = Settings::default();
        assert!(settings.toggle_watch("g", 1, 1000));
        assert_eq!(settings.watermark("g", 1), Some(1000));

        settings.set_watermark("g", 1, 2000);
        assert_eq!(settings.watermark("g", 1), Some(2000));
        // never moves backwards
        settings.set_watermark("g", 1, 1500);
        assert_eq!(settings.watermark("g", 1), Some(2000));
        // unwatched threads are untouched
        settings.set_watermark("g", 9, 99);
        assert!(settings.watermark("g", 9).is_none());

        assert!(!settings.toggle_watch("g", 1, 3000));
        assert!(settings.watermark("g", 1).is_none());
    }
}
