use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A candidate verse returned by the suggestion service. Field names stay in
/// camelCase on the wire so payloads match the stored-gallery format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerseSuggestion {
    pub verse_text: String,
    pub verse_reference: String,
}

impl VerseSuggestion {
    pub fn new(verse_text: impl Into<String>, verse_reference: impl Into<String>) -> Self {
        Self {
            verse_text: verse_text.into(),
            verse_reference: verse_reference.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.verse_text.trim().is_empty() && !self.verse_reference.trim().is_empty()
    }
}

/// A finished card: verse, explanation and image, as persisted in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerseResult {
    pub id: String,
    pub verse_text: String,
    pub verse_reference: String,
    pub explanation: String,
    pub image_url: String,
    pub is_favorite: bool,
    pub created_at: i64,
}

impl VerseResult {
    pub fn from_parts(suggestion: VerseSuggestion, explanation: String, image_url: String) -> Self {
        Self {
            id: fresh_card_id(),
            verse_text: suggestion.verse_text,
            verse_reference: suggestion.verse_reference,
            explanation,
            image_url,
            is_favorite: false,
            created_at: timestamp_millis(),
        }
    }

    /// Share caption, same shape the original card composer used.
    pub fn caption(&self) -> String {
        format!("\"{}\" - {}", self.verse_text, self.verse_reference)
    }
}

pub fn fresh_card_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{VerseResult, VerseSuggestion};

    #[test]
    fn suggestion_completeness_requires_both_fields() {
        assert!(VerseSuggestion::new("Tudo posso", "Filipenses 4:13").is_complete());
        assert!(!VerseSuggestion::new("  ", "Filipenses 4:13").is_complete());
        assert!(!VerseSuggestion::new("Tudo posso", "").is_complete());
    }

    #[test]
    fn result_serializes_with_camel_case_keys() -> anyhow::Result<()> {
        let result = VerseResult::from_parts(
            VerseSuggestion::new("Tudo posso", "Filipenses 4:13"),
            "explicação".to_string(),
            "https://example.com/a.jpg".to_string(),
        );
        let value = serde_json::to_value(&result)?;
        assert!(value.get("verseText").is_some());
        assert!(value.get("verseReference").is_some());
        assert!(value.get("imageUrl").is_some());
        assert!(value.get("isFavorite").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(!result.id.is_empty());
        Ok(())
    }

    #[test]
    fn caption_embeds_text_and_reference() {
        let result = VerseResult::from_parts(
            VerseSuggestion::new("Tudo posso", "Filipenses 4:13"),
            String::new(),
            String::new(),
        );
        assert_eq!(result.caption(), "\"Tudo posso\" - Filipenses 4:13");
    }
}
