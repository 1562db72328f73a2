use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::cards::VerseResult;

/// Cached verse-of-the-day entry, valid only for the calendar day it was
/// created on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    pub verse: VerseResult,
    pub date: String,
}

#[derive(Debug, Clone)]
pub struct DailyVerseStore {
    path: PathBuf,
}

impl DailyVerseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<DailyEntry> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Returns the cached verse only when it was stored today and carries a
    /// usable image. Anything else means the caller must regenerate.
    pub fn fresh(&self, today: &str) -> Option<VerseResult> {
        let entry = self.load()?;
        if entry.date != today || entry.verse.image_url.trim().is_empty() {
            return None;
        }
        Some(entry.verse)
    }

    pub fn store(&self, verse: &VerseResult, date: &str) -> anyhow::Result<()> {
        let entry = DailyEntry {
            verse: verse.clone(),
            date: date.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entry)?)?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn today_local() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use crate::cards::{VerseResult, VerseSuggestion};

    use super::{today_local, DailyVerseStore};

    fn verse(image_url: &str) -> VerseResult {
        VerseResult::from_parts(
            VerseSuggestion::new("Tudo posso", "Filipenses 4:13"),
            "explicação".to_string(),
            image_url.to_string(),
        )
    }

    #[test]
    fn fresh_requires_matching_date() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DailyVerseStore::new(temp.path().join("daily.json"));
        let cached = verse("https://example.com/a.jpg");
        store.store(&cached, "2026-08-04")?;

        assert!(store.fresh("2026-08-05").is_none());
        assert_eq!(store.fresh("2026-08-04").map(|row| row.id), Some(cached.id));
        Ok(())
    }

    #[test]
    fn fresh_rejects_entries_without_an_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DailyVerseStore::new(temp.path().join("daily.json"));
        store.store(&verse("  "), "2026-08-05")?;
        assert!(store.fresh("2026-08-05").is_none());
        Ok(())
    }

    #[test]
    fn clear_removes_the_cache_and_tolerates_absence() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DailyVerseStore::new(temp.path().join("daily.json"));
        store.clear()?;
        store.store(&verse("https://example.com/a.jpg"), &today_local())?;
        assert!(store.load().is_some());
        store.clear()?;
        assert!(store.load().is_none());
        Ok(())
    }

    #[test]
    fn today_local_is_iso_date_shaped() {
        let today = today_local();
        assert_eq!(today.len(), 10);
        assert_eq!(today.as_bytes()[4], b'-');
        assert_eq!(today.as_bytes()[7], b'-');
    }
}
