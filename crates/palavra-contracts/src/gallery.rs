use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::cards::{fresh_card_id, timestamp_millis, VerseResult};

/// Persisted card collection, newest first, unique by id.
///
/// Stored as a plain JSON array so galleries serialized by the original
/// client load unchanged. Entries missing an `id` or `createdAt` are
/// migrated in memory on load; the file is only rewritten on the next
/// natural save.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryStore {
    path: PathBuf,
    items: Vec<VerseResult>,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Array(Vec::new()));
        let Some(rows) = payload.as_array() else {
            return store;
        };
        for row in rows {
            if let Some(item) = migrate_entry(row) {
                store.items.push(item);
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn items(&self) -> &[VerseResult] {
        self.items.as_slice()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&VerseResult> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Prepends a freshly generated card and persists the collection.
    pub fn add_front(&mut self, item: VerseResult) -> anyhow::Result<()> {
        self.items.retain(|existing| existing.id != item.id);
        self.items.insert(0, item);
        self.save()
    }

    /// Removes by id. Returns false when no entry matched.
    pub fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        if self.items.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Flips the favorite flag, returning the new state when the id exists.
    pub fn toggle_favorite(&mut self, id: &str) -> anyhow::Result<Option<bool>> {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return Ok(None);
        };
        item.is_favorite = !item.is_favorite;
        let state = item.is_favorite;
        self.save()?;
        Ok(Some(state))
    }

    /// Swaps the image of an existing card, returning the updated entry.
    pub fn replace_image(&mut self, id: &str, image_url: &str) -> anyhow::Result<Option<VerseResult>> {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return Ok(None);
        };
        item.image_url = image_url.to_string();
        let updated = item.clone();
        self.save()?;
        Ok(Some(updated))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let rows = self
            .items
            .iter()
            .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
            .collect::<Vec<Value>>();
        write_json(&self.path, Value::Array(rows))
    }
}

fn migrate_entry(row: &Value) -> Option<VerseResult> {
    let obj = row.as_object()?;
    let text_field = |key: &str| -> String {
        obj.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(fresh_card_id);
    let created_at = obj
        .get("createdAt")
        .and_then(Value::as_i64)
        .unwrap_or_else(timestamp_millis);

    Some(VerseResult {
        id,
        verse_text: text_field("verseText"),
        verse_reference: text_field("verseReference"),
        explanation: text_field("explanation"),
        image_url: text_field("imageUrl"),
        is_favorite: obj
            .get("isFavorite")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        created_at,
    })
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::cards::{VerseResult, VerseSuggestion};

    use super::GalleryStore;

    fn card(text: &str, reference: &str) -> VerseResult {
        VerseResult::from_parts(
            VerseSuggestion::new(text, reference),
            "explicação".to_string(),
            "https://example.com/a.jpg".to_string(),
        )
    }

    #[test]
    fn gallery_roundtrip_keeps_newest_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery.json");
        let mut store = GalleryStore::new(&path);

        let first = card("Primeiro", "Salmos 23:1");
        let second = card("Segundo", "João 14:27");
        store.add_front(first.clone())?;
        store.add_front(second.clone())?;

        let reloaded = GalleryStore::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.items()[0].id, second.id);
        assert_eq!(reloaded.items()[1].id, first.id);
        Ok(())
    }

    #[test]
    fn load_synthesizes_missing_id_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery.json");
        let legacy = json!([
            {
                "verseText": "Tudo posso",
                "verseReference": "Filipenses 4:13",
                "explanation": "força",
                "imageUrl": "https://example.com/a.jpg",
                "isFavorite": true
            },
            {
                "id": "keep-me",
                "verseText": "O Senhor é o meu pastor",
                "verseReference": "Salmos 23:1",
                "explanation": "confiança",
                "imageUrl": "https://example.com/b.jpg",
                "isFavorite": false,
                "createdAt": 1700000000000i64
            }
        ]);
        std::fs::write(&path, serde_json::to_string(&legacy)?)?;

        let store = GalleryStore::load(&path);
        assert_eq!(store.len(), 2);
        assert!(!store.items()[0].id.is_empty());
        assert!(store.items()[0].created_at > 0);
        assert!(store.items()[0].is_favorite);
        assert_eq!(store.items()[1].id, "keep-me");
        assert_eq!(store.items()[1].created_at, 1_700_000_000_000);
        Ok(())
    }

    #[test]
    fn migration_is_not_written_back_until_next_save() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery.json");
        let legacy = json!([{ "verseText": "Tudo posso", "verseReference": "Filipenses 4:13" }]);
        let raw = serde_json::to_string(&legacy)?;
        std::fs::write(&path, &raw)?;

        let mut store = GalleryStore::load(&path);
        assert_eq!(std::fs::read_to_string(&path)?, raw);

        store.add_front(card("Novo", "João 3:16"))?;
        let rewritten: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let rows = rewritten.as_array().map(Vec::len).unwrap_or(0);
        assert_eq!(rows, 2);
        Ok(())
    }

    #[test]
    fn remove_and_toggle_mutate_persisted_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery.json");
        let mut store = GalleryStore::new(&path);
        let item = card("Tudo posso", "Filipenses 4:13");
        let id = item.id.clone();
        store.add_front(item)?;

        assert_eq!(store.toggle_favorite(&id)?, Some(true));
        let reloaded = GalleryStore::load(&path);
        assert!(reloaded.get(&id).map(|row| row.is_favorite).unwrap_or(false));

        let mut store = reloaded;
        assert!(store.remove(&id)?);
        assert!(!store.remove(&id)?);
        assert!(GalleryStore::load(&path).is_empty());
        Ok(())
    }

    #[test]
    fn missing_or_invalid_file_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery.json");
        assert!(GalleryStore::load(&path).is_empty());

        std::fs::write(&path, "not json")?;
        assert!(GalleryStore::load(&path).is_empty());
        Ok(())
    }
}
