use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only journal of generation activity (`events.jsonl`).
///
/// Every record carries `event`, `session_id` and `at`; the caller payload is
/// merged last and may override the defaults. One compact JSON object per
/// line, so failures mid-run never corrupt earlier records.
#[derive(Debug, Clone)]
pub struct EventJournal {
    inner: Arc<EventJournalInner>,
}

#[derive(Debug)]
struct EventJournalInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventJournalInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        row.insert("at".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn record_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let journal = EventJournal::new(&path, "sess-1");

        let mut payload = EventPayload::new();
        payload.insert("theme".to_string(), Value::String("paz".to_string()));
        let emitted = journal.record("suggestions_requested", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(
            parsed["event"],
            Value::String("suggestions_requested".to_string())
        );
        assert_eq!(parsed["session_id"], Value::String("sess-1".to_string()));
        assert_eq!(parsed["theme"], Value::String("paz".to_string()));

        let at = parsed["at"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(at)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let journal = EventJournal::new(&path, "sess-1");

        let mut payload = EventPayload::new();
        payload.insert(
            "session_id".to_string(),
            Value::String("override".to_string()),
        );
        let emitted = journal.record("card_created", payload)?;
        assert_eq!(emitted["session_id"], Value::String("override".to_string()));
        Ok(())
    }

    #[test]
    fn record_appends_lines_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let journal = EventJournal::new(&path, "sess-1");

        journal.record("one", EventPayload::new())?;
        journal.record("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let kinds: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(kinds, vec!["one".to_string(), "two".to_string()]);
        Ok(())
    }
}
